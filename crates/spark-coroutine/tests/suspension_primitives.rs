//! 挂起原语在外部执行器（`futures::executor::block_on`）与阻塞桥下的行为。

use std::{
    sync::{Arc, mpsc},
    thread,
    time::{Duration, Instant},
};

use futures::executor::block_on;
use spark_coroutine::{
    CompletionCallback, CompletionSource, Context, Continuation, CoroutineError, Executor,
    OffloadPolicy,
    Promise, ThreadPool, await_completion, delay, dispatched, offload, run_blocking,
    run_blocking_in, suspend_coroutine,
};

/// 违规地把回调调用两次的事件源。
struct FiresTwice<T> {
    first: Result<T, CoroutineError>,
    second: Result<T, CoroutineError>,
    from_other_thread: bool,
}

impl<T: Send + 'static> CompletionSource<T> for FiresTwice<T> {
    fn on_complete(self, mut callback: CompletionCallback<T>) {
        let fire = move || {
            callback(self.first);
            callback(self.second);
        };
        if self.from_other_thread {
            thread::spawn(fire);
        } else {
            fire();
        }
    }
}

/// 丢弃回调而从不调用的事件源。
struct Silent;

impl CompletionSource<u8> for Silent {
    fn on_complete(self, callback: CompletionCallback<u8>) {
        drop(callback);
    }
}

#[test]
fn delay_under_foreign_executor() {
    let start = Instant::now();
    block_on(delay(Duration::from_millis(10))).expect("delay");
    assert!(start.elapsed() >= Duration::from_millis(10));
}

#[test]
fn promise_completed_from_other_thread() {
    let promise = Promise::new();
    let producer = promise.clone();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        producer.complete(String::from("payload"));
    });
    let value = run_blocking(await_completion(promise)).expect("completed");
    assert_eq!(value, "payload");
    handle.join().expect("producer");
}

#[test]
fn promise_failure_keeps_message() {
    let promise = Promise::<u32>::new();
    promise.fail(CoroutineError::failed("upstream timeout"));
    let err = block_on(await_completion(promise)).expect_err("failed");
    assert_eq!(err.to_string(), "upstream timeout");
}

#[test]
fn double_fire_keeps_first_result_inline() {
    let source = FiresTwice {
        first: Ok(1),
        second: Ok(2),
        from_other_thread: false,
    };
    assert_eq!(run_blocking(await_completion(source)).ok(), Some(1));
}

#[test]
fn double_fire_does_not_corrupt_pending_bridge() {
    let pool = Arc::new(ThreadPool::new(2).expect("pool"));
    for _ in 0..32 {
        let source = FiresTwice {
            first: Ok("first"),
            second: Err(CoroutineError::failed("second")),
            from_other_thread: true,
        };
        let outcome = run_blocking_in(dispatched(pool.clone()), await_completion(source));
        assert_eq!(outcome.ok(), Some("first"));
    }
    pool.shutdown();
}

#[test]
fn silent_source_yields_abandoned() {
    let outcome = block_on(await_completion(Silent));
    assert!(matches!(outcome, Err(CoroutineError::Abandoned)));
}

#[test]
fn dropped_continuation_yields_abandoned() {
    let outcome = block_on(suspend_coroutine(|continuation: Continuation<u8>| {
        drop(continuation);
    }));
    assert!(matches!(outcome, Err(CoroutineError::Abandoned)));
}

#[test]
fn continuation_resumed_from_other_thread() {
    let (tx, rx) = mpsc::channel::<Continuation<u32>>();
    let resumer = thread::spawn(move || {
        let continuation = rx.recv().expect("continuation handed over");
        continuation.resume_with_value(99);
    });
    let value = block_on(suspend_coroutine(move |continuation| {
        tx.send(continuation).ok();
    }));
    assert_eq!(value.ok(), Some(99));
    resumer.join().expect("resumer");
}

#[test]
fn offload_runs_off_the_pool_and_returns_value() {
    let pool = Arc::new(
        ThreadPool::builder()
            .threads(1)
            .name_prefix("offload-host")
            .build()
            .expect("pool"),
    );
    let context = dispatched(pool.clone()).with(OffloadPolicy::new("blocking-io"));
    let pool_view = Arc::clone(&pool);
    let (worker, resumed_on_pool) = run_blocking_in(context, async move {
        let worker = offload(|| thread::current().name().map(str::to_owned))
            .await
            .expect("offload");
        (worker, pool_view.contains_current_thread())
    });
    let worker = worker.expect("named offload thread");
    assert!(worker.starts_with("blocking-io-"), "{worker}");
    assert!(resumed_on_pool, "卸载完成后回到调度器线程池");
    pool.shutdown();
}

#[test]
fn offload_panic_is_delivered_as_failure() {
    let err = block_on(offload(|| -> u8 { panic!("disk on fire") })).expect_err("panicked");
    assert!(err.is_panic());
    assert_eq!(err.panic_message(), Some("disk on fire"));
}

#[test]
fn offload_honours_default_policy_outside_runtime() {
    assert!(Context::current().is_empty());
    let name = block_on(offload(|| thread::current().name().map(str::to_owned)))
        .expect("offload")
        .expect("named");
    assert!(name.starts_with("spark-offload-"), "{name}");
}
