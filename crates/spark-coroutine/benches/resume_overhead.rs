use criterion::{Criterion, black_box};
use spark_coroutine::{
    Continuation, Executor, ThreadPool, dispatched, run_blocking, run_blocking_in,
    suspend_coroutine,
};
use std::{env, sync::Arc, time::Duration};

/// 续体恢复与调度的往返成本。
///
/// # 设计背景（Why）
/// - 每个挂起点都要经过“登记续体 -> 恢复 -> 唤醒任务 -> 重新轮询”；这一路径的开销决定了协程是否适合细粒度挂起。
///
/// # 逻辑解析（How）
/// - `inline`：空上下文，挂起后立即在同线程恢复，测量任务驱动器与结果槽本身的开销；
/// - `dispatched`：上下文含单线程池调度器，额外包含两次跨线程投递与条件变量唤醒。
fn bench_resume(c: &mut Criterion) {
    c.bench_function("resume_inline", |b| {
        b.iter(|| {
            let value = run_blocking(async {
                suspend_coroutine(|continuation: Continuation<u64>| {
                    continuation.resume_with_value(black_box(7))
                })
                .await
            });
            black_box(value)
        });
    });

    let pool = Arc::new(ThreadPool::new(1).expect("pool"));
    let context = dispatched(pool.clone());
    c.bench_function("resume_dispatched", |b| {
        b.iter(|| {
            let value = run_blocking_in(context.clone(), async {
                suspend_coroutine(|continuation: Continuation<u64>| {
                    continuation.resume_with_value(black_box(7))
                })
                .await
            });
            black_box(value)
        });
    });
    pool.shutdown();
}

fn main() {
    let mut quick_mode = false;
    for arg in env::args().skip(1) {
        if arg == "--quick" {
            quick_mode = true;
        }
    }

    let mut criterion = Criterion::default();
    if quick_mode {
        criterion = criterion
            .sample_size(10)
            .warm_up_time(Duration::from_millis(100))
            .measurement_time(Duration::from_millis(250));
    }

    bench_resume(&mut criterion);
    criterion.final_summary();
}
