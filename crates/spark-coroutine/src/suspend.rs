//! 挂起原语：`delay`、`await_completion`、`offload`。
//!
//! # 设计背景（Why）
//! - 三个原语都建立在 [`suspend_coroutine`] 之上：把续体交给某个事件源（定时器、外部回调、专用线程），
//!   事件发生时恢复；恢复后在哪个线程继续由任务的调度器决定，与事件线程无关；
//! - 事件源可能在登记失败后同步报错，也可能在稍后的线程上回调，因此统一使用
//!   [`SharedContinuation`]：登记路径与回调路径谁先到谁恢复，另一方拿回结果。
//!
//! # 契约说明（What）
//! - 三者都返回 `Result<_, CoroutineError>`，失败原因可区分（定时器拒绝、线程创建失败、panic、遗弃）；
//! - 没有取消：挂起一旦开始，只会以恢复结束。

use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use crate::{
    context::{Context, Element},
    continuation::{Continuation, SharedContinuation, suspend_coroutine},
    error::{CoroutineError, ExecutorError},
    promise::CompletionSource,
    timer::{ThreadTimer, Timer, TimerService},
};

/// 挂起当前协程至少 `duration`。
///
/// # 教案式说明
/// - **逻辑 (How)**：定时器取自续体上下文中的 [`TimerService`]，缺省回落到 [`ThreadTimer::shared`]；
///   到期回调运行在定时器线程上，只负责恢复续体。上下文含调度器时恢复被投递到线程池；
///   不含调度器时，恢复转交给一条短生命周期线程（[`DELAY_RESUME_THREAD`]），协程余下部分在那里继续。
/// - **契约 (What)**：
///   - `duration` 为零时不挂起，直接返回；
///   - 恢复时实际经过的时间不小于 `duration`；
///   - 协程余下部分从不在定时器线程上运行，因此在其中嵌套 `run_blocking` 再 `delay` 不会卡死定时器；
///   - 定时器拒绝登记（已关闭、`duration` 过大）时返回 [`CoroutineError::Timer`]；
///     定时器关闭丢弃条目时返回 [`CoroutineError::Abandoned`]。
pub async fn delay(duration: Duration) -> Result<(), CoroutineError> {
    if duration.is_zero() {
        return Ok(());
    }
    suspend_coroutine(move |continuation: Continuation<()>| {
        let timer = match timer_for(continuation.context()) {
            Ok(timer) => timer,
            Err(err) => {
                continuation.resume_with_error(CoroutineError::Timer(err));
                return;
            }
        };
        let hand_off = continuation.context().dispatcher().is_none();
        let shared = SharedContinuation::new(continuation);
        let fire = shared.clone();
        let scheduled = timer.schedule(
            duration,
            Box::new(move || {
                if hand_off {
                    resume_off_timer(fire);
                } else {
                    fire.try_resume(Ok(())).ok();
                }
            }),
        );
        if let Err(err) = scheduled {
            shared.try_resume(Err(CoroutineError::Timer(err))).ok();
        }
    })
    .await
}

/// 无调度器时承接 `delay` 恢复的线程名。
pub const DELAY_RESUME_THREAD: &str = "spark-delay-resume";

fn resume_off_timer(continuation: SharedContinuation<()>) {
    let resumer = continuation.clone();
    let spawned = thread::Builder::new()
        .name(DELAY_RESUME_THREAD.to_owned())
        .spawn(move || {
            resumer.try_resume(Ok(())).ok();
        });
    if let Err(err) = spawned {
        // 只剩定时器线程可用：以失败恢复，让协程尽快结束。
        tracing::error!(error = %err, "failed to spawn delay resume thread");
        continuation.try_resume(Err(CoroutineError::Spawn(err))).ok();
    }
}

fn timer_for(context: &Context) -> Result<Arc<dyn Timer>, ExecutorError> {
    match context.get::<TimerService>() {
        Some(service) => Ok(Arc::clone(service.timer())),
        None => {
            let timer: Arc<dyn Timer> = ThreadTimer::shared()?;
            Ok(timer)
        }
    }
}

/// 挂起直到回调式外部 future 完成。
///
/// 第一次回调恢复协程；之后的回调被拒绝并以 `error` 级别记录，首个结果不受影响。
/// 事件源丢弃回调而从未调用时，返回 [`CoroutineError::Abandoned`]。
pub async fn await_completion<T, S>(source: S) -> Result<T, CoroutineError>
where
    T: Send + 'static,
    S: CompletionSource<T>,
{
    suspend_coroutine(move |continuation: Continuation<T>| {
        let shared = SharedContinuation::new(continuation);
        source.on_complete(Box::new(move |outcome| {
            if let Err(late) = shared.try_resume(outcome) {
                tracing::error!(
                    success = late.outcome.is_ok(),
                    "completion callback invoked more than once; keeping the first result"
                );
            }
        }));
    })
    .await
}

static OFFLOAD_SEQUENCE: AtomicUsize = AtomicUsize::new(0);

const DEFAULT_OFFLOAD_PREFIX: &str = "spark-offload";

/// 卸载线程策略，作为上下文元素随协程流动。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OffloadPolicy {
    thread_name_prefix: String,
    stack_size: Option<usize>,
}

impl OffloadPolicy {
    pub fn new(thread_name_prefix: impl Into<String>) -> Self {
        Self {
            thread_name_prefix: thread_name_prefix.into(),
            stack_size: None,
        }
    }

    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    pub fn thread_name_prefix(&self) -> &str {
        &self.thread_name_prefix
    }

    pub fn stack_size(&self) -> Option<usize> {
        self.stack_size
    }

    fn next_thread_name(&self) -> String {
        let sequence = OFFLOAD_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        format!("{}-{sequence}", self.thread_name_prefix)
    }
}

impl Default for OffloadPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_OFFLOAD_PREFIX)
    }
}

impl Element for OffloadPolicy {}

impl fmt::Display for OffloadPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-*", self.thread_name_prefix)
    }
}

/// 在一条新建的专用线程上执行阻塞代码，完成后恢复协程。
///
/// # 教案式说明
/// - **意图 (Why)**：阻塞 I/O 或长时间计算不能占用调度器线程池，否则池内其他协程会被饿死。
/// - **逻辑 (How)**：按上下文中的 [`OffloadPolicy`] 命名线程；`block` 在 `catch_unwind` 中执行，
///   结果（或 panic）经续体交回。
/// - **契约 (What)**：
///   - `block` 从不在调度器线程上运行；
///   - `block` panic 时返回 [`CoroutineError::Panicked`]，载荷保留原始消息；
///   - 线程创建失败时返回 [`CoroutineError::Spawn`]。
pub async fn offload<T, F>(block: F) -> Result<T, CoroutineError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    suspend_coroutine(move |continuation: Continuation<T>| {
        let policy = continuation
            .context()
            .get::<OffloadPolicy>()
            .cloned()
            .unwrap_or_default();
        let name = policy.next_thread_name();
        let shared = SharedContinuation::new(continuation);
        let worker = shared.clone();
        let mut builder = thread::Builder::new().name(name.clone());
        if let Some(bytes) = policy.stack_size() {
            builder = builder.stack_size(bytes);
        }
        let spawned = builder.spawn(move || {
            tracing::debug!(thread = %name, "offload started");
            let outcome =
                panic::catch_unwind(AssertUnwindSafe(block)).map_err(CoroutineError::panicked);
            tracing::debug!(thread = %name, success = outcome.is_ok(), "offload finished");
            worker.try_resume(outcome).ok();
        });
        if let Err(err) = spawned {
            tracing::error!(error = %err, "failed to spawn offload thread");
            shared.try_resume(Err(CoroutineError::Spawn(err))).ok();
        }
    })
    .await
}
