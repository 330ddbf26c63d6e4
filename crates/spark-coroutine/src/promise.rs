//! 回调式外部 future 的桥接契约与一个最小实现。
//!
//! # 设计背景（Why）
//! - 外部系统（I/O 库、RPC 客户端）常以“完成回调”暴露异步结果；协程需要一个统一入口把它们接成挂起点；
//! - 这类回调通常是 `FnMut`，实现方可能违规多次调用，桥接层必须容忍并记录。
//!
//! # 契约说明（What）
//! - [`CompletionSource::on_complete`] 按值消费事件源并登记回调；结果已就绪时可以在登记线程上立即回调；
//! - [`Promise`] 只允许一个消费者，第二个消费者立即收到失败。

use std::{fmt, sync::Arc};

use parking_lot::Mutex;

use crate::error::CoroutineError;

/// 完成回调。
pub type CompletionCallback<T> = Box<dyn FnMut(Result<T, CoroutineError>) + Send + 'static>;

/// 可以通过回调报告完成的外部 future。
pub trait CompletionSource<T>: Send + 'static {
    fn on_complete(self, callback: CompletionCallback<T>);
}

enum PromiseState<T> {
    Waiting(Option<CompletionCallback<T>>),
    Done(Option<Result<T, CoroutineError>>),
    Consumed,
}

/// 由生产方手动完成的单消费者 future。
///
/// # 教案式说明
/// - **意图 (Why)**：在测试与适配层中模拟“某个外部线程稍后给出结果”的场景。
/// - **逻辑 (How)**：`parking_lot::Mutex` 保护三态；回调总是在锁外执行，回调内再次访问 `Promise` 不会死锁。
/// - **契约 (What)**：
///   - `complete`/`fail` 只有第一次生效，返回值表示是否生效；
///   - 消费者先登记时，回调运行在完成方线程；结果先就绪时，回调运行在登记方线程。
pub struct Promise<T> {
    state: Arc<Mutex<PromiseState<T>>>,
}

impl<T: Send + 'static> Promise<T> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(PromiseState::Waiting(None))),
        }
    }

    /// 以成功值完成。
    pub fn complete(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// 以失败完成。
    pub fn fail(&self, error: CoroutineError) -> bool {
        self.settle(Err(error))
    }

    pub fn is_completed(&self) -> bool {
        !matches!(*self.state.lock(), PromiseState::Waiting(_))
    }

    fn settle(&self, outcome: Result<T, CoroutineError>) -> bool {
        let mut state = self.state.lock();
        match &mut *state {
            PromiseState::Waiting(callback) => match callback.take() {
                Some(mut callback) => {
                    *state = PromiseState::Consumed;
                    drop(state);
                    callback(outcome);
                    true
                }
                None => {
                    *state = PromiseState::Done(Some(outcome));
                    true
                }
            },
            PromiseState::Done(_) | PromiseState::Consumed => false,
        }
    }
}

impl<T: Send + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: Send + 'static> CompletionSource<T> for Promise<T> {
    fn on_complete(self, mut callback: CompletionCallback<T>) {
        let mut state = self.state.lock();
        match &mut *state {
            PromiseState::Waiting(slot) if slot.is_none() => {
                *slot = Some(callback);
            }
            PromiseState::Done(outcome) => {
                let outcome = outcome.take();
                *state = PromiseState::Consumed;
                drop(state);
                if let Some(outcome) = outcome {
                    callback(outcome);
                }
            }
            PromiseState::Waiting(_) | PromiseState::Consumed => {
                drop(state);
                callback(Err(CoroutineError::failed("promise already has a consumer")));
            }
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match *self.state.lock() {
            PromiseState::Waiting(_) => "waiting",
            PromiseState::Done(_) => "done",
            PromiseState::Consumed => "consumed",
        };
        f.debug_struct("Promise").field("state", &state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn recorder<T: Send + 'static>() -> (CompletionCallback<T>, mpsc::Receiver<Result<T, String>>) {
        let (tx, rx) = mpsc::channel();
        let callback: CompletionCallback<T> = Box::new(move |outcome: Result<T, CoroutineError>| {
            tx.send(outcome.map_err(|err| err.to_string())).ok();
        });
        (callback, rx)
    }

    #[test]
    fn completes_registered_consumer_once() {
        let promise = Promise::new();
        let (callback, rx) = recorder::<u32>();
        promise.clone().on_complete(callback);
        assert!(!promise.is_completed());
        assert!(promise.complete(5));
        assert!(!promise.complete(6), "第二次完成必须被忽略");
        assert_eq!(rx.try_recv().ok(), Some(Ok(5)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn late_consumer_sees_stored_failure() {
        let promise = Promise::<u32>::new();
        assert!(promise.fail(CoroutineError::failed("refused")));
        let (callback, rx) = recorder();
        promise.on_complete(callback);
        assert_eq!(rx.try_recv().ok(), Some(Err("refused".to_owned())));
    }

    #[test]
    fn second_consumer_is_rejected() {
        let promise = Promise::<u32>::new();
        let (first, _first_rx) = recorder();
        let (second, second_rx) = recorder();
        promise.clone().on_complete(first);
        promise.clone().on_complete(second);
        assert!(matches!(second_rx.try_recv(), Ok(Err(_))));
    }
}
