//! 调度器：把“事件在哪里发生”与“续体剩余代码在哪里执行”解耦。
//!
//! # 设计背景（Why）
//! - 定时器线程、卸载线程、外部回调线程都可能触发恢复；若直接在这些线程上继续执行协程，
//!   业务代码会在不可控的线程上运行；
//! - 调度器作为 [`Context`] 元素随协程流动，每一次恢复都经由 [`Dispatcher::dispatch`] 投递到指定执行器。
//!
//! # 契约说明（What）
//! - `dispatch` 永远提交到执行器，即使执行器此刻有空闲线程也不会就地执行，避免递归恢复导致栈增长；
//! - 执行器拒绝任务时必须响亮失败：记录 `error` 日志并把失败交还调用方，不允许悄悄丢弃续体。

use std::{fmt, sync::Arc};

use parking_lot::Mutex;

use crate::{
    context::{Context, Element},
    continuation::{Continuation, Sink},
    error::{CoroutineError, ExecutorError},
    executor::Executor,
};

/// 包装执行器的调度策略对象。
#[derive(Clone)]
pub struct Dispatcher {
    executor: Arc<dyn Executor>,
}

impl Dispatcher {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self { executor }
    }

    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.executor
    }

    /// 将任务提交到执行器。
    ///
    /// # 错误
    /// - 执行器已关闭时返回 [`ExecutorError::Shutdown`]，同时记录 `error` 日志。
    pub fn dispatch(&self, task: impl FnOnce() + Send + 'static) -> Result<(), ExecutorError> {
        self.executor.submit(Box::new(task)).inspect_err(|err| {
            tracing::error!(
                executor = self.executor.name(),
                error = %err,
                "dispatcher rejected task; continuation would be lost"
            );
        })
    }

    /// 让续体的每次恢复都经由本调度器转发。
    pub fn intercept<T: Send + 'static>(&self, continuation: Continuation<T>) -> Continuation<T> {
        let context = continuation.context().with(self.clone());
        continuation.retarget(context)
    }

    /// 把回调式续体的交付投递到执行器；被拒绝时在当前线程以 `Rejected` 失败交付。
    pub(crate) fn dispatch_outcome<T: Send + 'static>(
        &self,
        sink: Sink<T>,
        outcome: Result<T, CoroutineError>,
    ) {
        let pending = Arc::new(Mutex::new(Some((sink, outcome))));
        let queued = Arc::clone(&pending);
        let submitted = self.dispatch(move || {
            if let Some((sink, outcome)) = queued.lock().take() {
                sink(outcome);
            }
        });
        if let Err(err) = submitted {
            if let Some((sink, _lost)) = pending.lock().take() {
                sink(Err(CoroutineError::Rejected(err)));
            }
        }
    }
}

impl Element for Dispatcher {}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("executor", &self.executor.name())
            .finish()
    }
}

impl From<Arc<dyn Executor>> for Dispatcher {
    fn from(executor: Arc<dyn Executor>) -> Self {
        Dispatcher::new(executor)
    }
}

/// 以调度器构造上下文的便捷函数。
pub fn dispatched(executor: Arc<dyn Executor>) -> Context {
    Context::of(Dispatcher::new(executor))
}
