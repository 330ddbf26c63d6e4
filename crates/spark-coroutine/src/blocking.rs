//! 阻塞桥：在普通（非协程）代码中运行协程直至完成，并同步返回结果。
//!
//! # 设计背景（Why）
//! - HTTP 客户端等同步调用点需要“发起异步调用并等待结果”，而协程在内部可能多次挂起、
//!   并在与调用线程不同的线程上恢复；
//! - 等待必须是真正的阻塞等待（条件变量），不能忙等占满一个核心。
//!
//! # 执行逻辑（How）
//! 1. 创建私有的 [`PendingWait`]（未触发）；
//! 2. 以终结续体启动协程，终结续体写入结果并触发一次；
//! 3. 调用线程在条件变量上阻塞；
//! 4. 被唤醒后读取结果：成功即返回，失败则在调用线程上重新抛出（panic 以原始载荷恢复）。
//!
//! # 契约说明（What）
//! - 每次调用拥有独立的等待原语，不同线程上的嵌套调用互不阻塞；
//! - 协程无挂起时，`run_blocking(fut)` 与直接求值等价，且全程在调用线程上执行；
//! - 终结续体的上下文为空：即使协程携带的执行器丢弃任务，终结续体也会在丢弃点就地交付 `Abandoned`。

use std::{future::Future, sync::Arc};

use parking_lot::{Condvar, Mutex};

use crate::{
    context::Context, continuation::Continuation, error::CoroutineError, task::Task,
};

/// 单次使用的等待原语与结果槽。
///
/// # 教案式说明
/// - **意图 (Why)**：把“结果到达”这一事件从任意线程传回阻塞中的调用线程。
/// - **逻辑 (How)**：`parking_lot::Mutex<Option<_>>` 存放结果，`Condvar` 负责唤醒；
///   `wait` 在结果为空时循环等待，天然免疫伪唤醒。
/// - **契约 (What)**：`signal` 只有第一次生效，重复触发被记录并忽略，已交付的结果不会被覆盖。
pub struct PendingWait<T> {
    outcome: Mutex<Option<Result<T, CoroutineError>>>,
    signaled: Mutex<bool>,
    ready: Condvar,
}

impl<T> PendingWait<T> {
    pub fn new() -> Self {
        Self {
            outcome: Mutex::new(None),
            signaled: Mutex::new(false),
            ready: Condvar::new(),
        }
    }

    /// 写入结果并唤醒等待方；返回是否为首次触发。
    pub fn signal(&self, outcome: Result<T, CoroutineError>) -> bool {
        let mut signaled = self.signaled.lock();
        if *signaled {
            tracing::warn!(
                success = outcome.is_ok(),
                "duplicate signal on blocking bridge ignored"
            );
            return false;
        }
        *self.outcome.lock() = Some(outcome);
        *signaled = true;
        drop(signaled);
        self.ready.notify_all();
        true
    }

    pub fn is_signaled(&self) -> bool {
        *self.signaled.lock()
    }

    /// 阻塞直到被触发，并取走结果。
    pub fn wait(&self) -> Result<T, CoroutineError> {
        let mut signaled = self.signaled.lock();
        while !*signaled {
            self.ready.wait(&mut signaled);
        }
        drop(signaled);
        // 结果只会被取走一次；再次等待视为续体已被消费。
        self.outcome.lock().take().unwrap_or(Err(CoroutineError::Abandoned))
    }
}

impl<T> Default for PendingWait<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// 在空上下文中运行协程并返回结果；失败在调用线程上重新抛出。
///
/// # Panics
/// - 协程 panic 时以原始载荷恢复 panic；
/// - 其他运行时失败（调度拒绝、续体遗弃等）以错误信息 panic。需要显式处理时使用 [`try_run_blocking`]。
pub fn run_blocking<F>(future: F) -> F::Output
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    run_blocking_in(Context::empty(), future)
}

/// 在给定上下文中运行协程。上下文含调度器时，协程体在调度器的执行器上运行，调用线程只负责等待。
pub fn run_blocking_in<F>(context: Context, future: F) -> F::Output
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    match try_run_blocking_in(context, future) {
        Ok(value) => value,
        Err(error) => error.raise(),
    }
}

/// [`run_blocking`] 的不展开版本：panic 与运行时失败都以 `Err` 返回。
pub fn try_run_blocking<F>(future: F) -> Result<F::Output, CoroutineError>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    try_run_blocking_in(Context::empty(), future)
}

/// [`run_blocking_in`] 的不展开版本。
pub fn try_run_blocking_in<F>(context: Context, future: F) -> Result<F::Output, CoroutineError>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let wait = Arc::new(PendingWait::<F::Output>::new());
    let signal = Arc::clone(&wait);
    let terminal = Continuation::new(Context::empty(), move |outcome| {
        signal.signal(outcome);
    });
    Task::start(context, future, terminal);
    wait.wait()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{thread, time::Duration};

    #[test]
    fn pending_wait_keeps_first_outcome() {
        let wait = PendingWait::new();
        assert!(wait.signal(Ok(1)));
        assert!(!wait.signal(Ok(2)), "重复触发不得覆盖首个结果");
        assert_eq!(wait.wait().ok(), Some(1));
    }

    #[test]
    fn pending_wait_blocks_until_signaled_from_other_thread() {
        let wait = Arc::new(PendingWait::new());
        let producer = Arc::clone(&wait);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.signal(Ok("late"));
        });
        assert_eq!(wait.wait().ok(), Some("late"));
        handle.join().expect("producer thread");
        assert!(wait.is_signaled());
    }
}
