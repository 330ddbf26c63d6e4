//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中定义协程运行时对外暴露的错误语义：计算失败、调度拒绝、续体遗弃、重复恢复；
//! - 让 `run_blocking` 能在调用线程上“原样”重新抛出失败，而不暴露失败发生在哪个工作线程。
//!
//! ## 设计要求（What）
//! - 所有错误均派生 `thiserror::Error`，可直接交给上层的 `anyhow`/`eyre` 处理；
//! - [`CoroutineError::Failed`] 采用透明展示，保证原始错误信息逐字保留；
//! - panic 载荷通过 [`PanicPayload`] 保存，桥接层可用 `resume_unwind` 还原原始 panic。

use std::{any::Any, fmt, io, panic, time::Duration};

use parking_lot::Mutex;
use thiserror::Error;

/// 跨线程传递的类型擦除错误。
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// 协程从启动到恢复全过程中可能出现的失败。
///
/// # 教案式说明
/// - **意图 (Why)**：续体只有一个恢复通道 `resume(Result<T, CoroutineError>)`，因此计算失败、
///   调度失败与资源失败必须统一到同一枚举中，避免出现“第二条错误通道”。
/// - **契约 (What)**：
///   - 所有变体均满足 `Send + Sync + 'static`，可在定时器线程、卸载线程与线程池之间移动；
///   - `Failed` 透明转发源错误的 `Display`，调用方看到的消息与原始失败完全一致；
///   - `Panicked` 持有 panic 载荷，只能被取走一次。
/// - **风险 (Trade-offs)**：因 `PanicPayload` 不可克隆，本枚举不实现 `Clone`；需要广播失败时请自行转为字符串。
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoroutineError {
    /// 用户计算返回的失败，消息逐字透传。
    #[error(transparent)]
    Failed(BoxError),

    /// 协程体或卸载任务发生 panic。
    #[error("coroutine panicked: {0}")]
    Panicked(PanicPayload),

    /// 调度器的执行器拒绝了恢复任务（通常是线程池已关闭）。
    #[error("dispatch rejected: {0}")]
    Rejected(#[source] ExecutorError),

    /// 定时器拒绝登记 `delay`。
    #[error("timer rejected delay: {0}")]
    Timer(#[source] ExecutorError),

    /// 卸载线程创建失败。
    #[error("failed to spawn offload thread: {0}")]
    Spawn(#[source] io::Error),

    /// 续体在未被恢复的情况下被丢弃，等待方收到该错误而不是永久挂起。
    #[error("continuation dropped without being resumed")]
    Abandoned,
}

impl CoroutineError {
    /// 以任意错误构造 [`CoroutineError::Failed`]。
    pub fn failed(error: impl Into<BoxError>) -> Self {
        CoroutineError::Failed(error.into())
    }

    /// 以 `catch_unwind` 捕获的载荷构造 [`CoroutineError::Panicked`]。
    pub fn panicked(payload: Box<dyn Any + Send + 'static>) -> Self {
        CoroutineError::Panicked(PanicPayload::new(payload))
    }

    /// 是否为 panic 失败。
    pub fn is_panic(&self) -> bool {
        matches!(self, CoroutineError::Panicked(_))
    }

    /// 若为 panic 失败，返回 panic 消息。
    pub fn panic_message(&self) -> Option<&str> {
        match self {
            CoroutineError::Panicked(payload) => Some(payload.message()),
            _ => None,
        }
    }

    /// 在调用线程上重新抛出失败。
    ///
    /// # 契约说明（What）
    /// - `Panicked`：以原始载荷 `resume_unwind`，`catch_unwind` 的观察者能拿回原来的 `&str`/`String`；
    /// - 其他变体：以错误的 `Display` 文本 panic。
    pub fn raise(self) -> ! {
        match self {
            CoroutineError::Panicked(payload) => payload.resume(),
            other => panic!("{other}"),
        }
    }
}

/// 捕获的 panic 载荷。
///
/// 载荷本身是 `Box<dyn Any + Send>`，不满足 `Sync`；这里放进互斥锁中，使错误类型可以跨线程共享引用。
pub struct PanicPayload {
    message: String,
    payload: Mutex<Option<Box<dyn Any + Send + 'static>>>,
}

impl PanicPayload {
    /// 包装载荷并提前提取可读消息。
    pub fn new(payload: Box<dyn Any + Send + 'static>) -> Self {
        let message = describe_panic(payload.as_ref());
        Self {
            message,
            payload: Mutex::new(Some(payload)),
        }
    }

    /// panic 消息；非字符串载荷显示为占位文本。
    pub fn message(&self) -> &str {
        &self.message
    }

    /// 取出原始载荷；只能成功一次。
    pub fn take(&self) -> Option<Box<dyn Any + Send + 'static>> {
        self.payload.lock().take()
    }

    /// 在当前线程恢复 panic。载荷已被取走时退化为以消息 panic。
    pub fn resume(self) -> ! {
        match self.payload.into_inner() {
            Some(payload) => panic::resume_unwind(payload),
            None => panic!("{}", self.message),
        }
    }
}

impl fmt::Debug for PanicPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PanicPayload")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for PanicPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

pub(crate) fn describe_panic(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// 执行器与定时器的提交失败。
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExecutorError {
    /// 执行器已关闭，不再接收任务。
    #[error("executor `{name}` has been shut down")]
    Shutdown { name: String },

    /// 创建工作线程失败。
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] io::Error),

    /// 延迟过大，截止时间超出 `Instant` 可表示的范围。
    #[error("delay of {delay:?} overflows the timer clock")]
    DeadlineOverflow { delay: Duration },
}

impl ExecutorError {
    pub(crate) fn shutdown(name: &str) -> Self {
        ExecutorError::Shutdown {
            name: name.to_owned(),
        }
    }
}

/// 对已被恢复的续体再次恢复时返回的错误，携带被拒绝的结果。
///
/// # 教案式说明
/// - **意图 (Why)**：回调式事件源（外部 future、定时器回调）可能违规多次触发；
///   第二次结果既不能覆盖第一次，也不能悄悄丢失，因此原样交还给调用方。
/// - **契约 (What)**：`outcome` 即被拒绝的那次恢复请求；第一次交付的结果保持不变。
pub struct ResumeError<T> {
    pub outcome: Result<T, CoroutineError>,
}

impl<T> ResumeError<T> {
    /// 取回被拒绝的结果。
    pub fn into_outcome(self) -> Result<T, CoroutineError> {
        self.outcome
    }
}

impl<T> fmt::Debug for ResumeError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResumeError")
            .field("is_success", &self.outcome.is_ok())
            .finish()
    }
}

impl<T> fmt::Display for ResumeError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("continuation already resumed")
    }
}

impl<T> std::error::Error for ResumeError<T> {}

/// 运行时配置的解析与校验失败。
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// TOML 语法或字段类型错误。
    #[error("failed to parse runtime configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// 字段取值不合法。
    #[error("invalid runtime configuration `{field}`: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },

    /// 根据配置启动线程池或定时器失败。
    #[error("failed to start runtime: {0}")]
    Start(#[from] ExecutorError),
}
