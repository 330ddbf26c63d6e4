//! 协程驱动器：把一个 `Future` 包装为可被唤醒、可被调度的任务。
//!
//! # 设计背景（Why）
//! - 续体恢复最终表现为对任务 waker 的一次 `wake`；调度拦截就发生在这里：
//!   上下文含调度器时把轮询投递到执行器，否则在触发唤醒的线程上就地轮询；
//! - 同一任务绝不能被两条线程同时轮询，也不能丢失“轮询期间到达的唤醒”。
//!
//! # 状态机（How）
//! ```text
//!   IDLE --wake--> SCHEDULED --run--> RUNNING --Pending--> IDLE
//!                                      |  \--wake--> NOTIFIED --(poll 结束)--> SCHEDULED
//!                                      \--Ready/panic--> COMPLETE
//! ```
//! - 只有把状态从 `IDLE` 推进到 `SCHEDULED` 的那次唤醒负责提交任务；
//! - `RUNNING` 期间的唤醒只把状态改为 `NOTIFIED`，由轮询方在结束时重新调度；
//! - 无调度器时在循环内直接重新轮询，避免递归加深调用栈。
//!
//! # 契约说明（What）
//! - 任务完成时通过终结续体（terminal continuation）交付结果；panic 被捕获为 [`CoroutineError::Panicked`]；
//! - 调度被拒绝时任务立即以 [`CoroutineError::Rejected`] 完成，不会悄悄挂起；
//! - 任务被整体丢弃（例如执行器丢弃了队列中的任务）时，终结续体以 `Abandoned` 自我恢复。

use std::{
    future::Future,
    panic::{self, AssertUnwindSafe},
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
    task::{Context as TaskContext, Poll},
};

use futures::task::{ArcWake, waker_ref};
use parking_lot::Mutex;

use crate::{context::Context, continuation::Continuation, error::CoroutineError};

const IDLE: u8 = 0;
const SCHEDULED: u8 = 1;
const RUNNING: u8 = 2;
const NOTIFIED: u8 = 3;
const COMPLETE: u8 = 4;

type BoxedFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

pub(crate) struct Task<T: Send + 'static> {
    state: AtomicU8,
    future: Mutex<Option<BoxedFuture<T>>>,
    terminal: Mutex<Option<Continuation<T>>>,
    context: Context,
}

impl<T: Send + 'static> Task<T> {
    /// 创建任务并立即调度首次轮询。
    ///
    /// 上下文含调度器时，首次轮询同样被投递到执行器，因此启动线程不会执行协程体。
    pub(crate) fn start<F>(context: Context, future: F, terminal: Continuation<T>)
    where
        F: Future<Output = T> + Send + 'static,
    {
        let task = Arc::new(Task {
            state: AtomicU8::new(SCHEDULED),
            future: Mutex::new(Some(Box::pin(future))),
            terminal: Mutex::new(Some(terminal)),
            context,
        });
        task.submit();
    }

    fn schedule(self: &Arc<Self>) {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let next = match current {
                IDLE => SCHEDULED,
                RUNNING => NOTIFIED,
                _ => return,
            };
            match self
                .state
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) if next == SCHEDULED => {
                    self.submit();
                    return;
                }
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// 状态必须已为 `SCHEDULED`。
    fn submit(self: &Arc<Self>) {
        match self.context.dispatcher() {
            Some(dispatcher) => {
                let task = Arc::clone(self);
                if let Err(err) = dispatcher.dispatch(move || task.run()) {
                    self.abort(CoroutineError::Rejected(err));
                }
            }
            None => self.run(),
        }
    }

    fn run(self: &Arc<Self>) {
        let span = tracing::trace_span!("coroutine", name = self.context.name().unwrap_or(""));
        let _entered = span.enter();
        loop {
            if self
                .state
                .compare_exchange(SCHEDULED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            let poll = {
                let mut slot = self.future.lock();
                let Some(future) = slot.as_mut() else {
                    self.state.store(COMPLETE, Ordering::Release);
                    return;
                };
                let waker = waker_ref(self);
                let mut cx = TaskContext::from_waker(&waker);
                let polled = self.context.enter(|| {
                    panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx)))
                });
                match polled {
                    Ok(Poll::Pending) => None,
                    Ok(Poll::Ready(value)) => {
                        let finished = slot.take();
                        drop(slot);
                        drop(finished);
                        Some(Ok(value))
                    }
                    Err(payload) => {
                        let finished = slot.take();
                        drop(slot);
                        drop(finished);
                        Some(Err(CoroutineError::panicked(payload)))
                    }
                }
            };
            tracing::trace!(completed = poll.is_some(), "coroutine polled");
            if let Some(outcome) = poll {
                self.state.store(COMPLETE, Ordering::Release);
                self.complete(outcome);
                return;
            }
            match self
                .state
                .compare_exchange(RUNNING, IDLE, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(_) => {
                    // 轮询期间收到唤醒（NOTIFIED）：重新进入 SCHEDULED。
                    self.state.store(SCHEDULED, Ordering::Release);
                    if self.context.dispatcher().is_some() {
                        self.submit();
                        return;
                    }
                }
            }
        }
    }

    fn abort(&self, error: CoroutineError) {
        self.state.store(COMPLETE, Ordering::Release);
        let future = self.future.lock().take();
        drop(future);
        self.complete(Err(error));
    }

    fn complete(&self, outcome: Result<T, CoroutineError>) {
        let terminal = self.terminal.lock().take();
        if let Some(terminal) = terminal {
            terminal.resume_in_place(outcome);
        }
    }
}

impl<T: Send + 'static> ArcWake for Task<T> {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.schedule();
    }
}
