//! 一次性续体与挂起原语的基础设施。
//!
//! # 模块定位（Why）
//! - 续体代表“挂起点之后的剩余程序”，必须且只能被恢复一次；
//! - Rust 以所有权表达“一次性”：[`Continuation::resume`] 按值消费续体，第二次恢复在编译期即被拒绝；
//! - 回调式事件源可能违规多次触发，为此提供 [`SharedContinuation`]，由 [`ResumeGate`] 的 CAS 决出唯一胜者。
//!
//! # 状态机（What）
//! - `Pending`：续体已登记，事件尚未发生；
//! - `Completing`：某条线程赢得 CAS，正在写入结果；
//! - `Resumed`：结果已交付，终态。
//!
//! # 风险提示（Trade-offs & Gotchas）
//! - 被丢弃而未恢复的续体会以 [`CoroutineError::Abandoned`] 自我恢复，等待方因此不会永久挂起；
//!   代价是事件源若“故意”丢弃续体，协程会看到失败而非静默停止。

use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context as TaskContext, Poll},
};

use futures::task::AtomicWaker;
use parking_lot::Mutex;

//
// 教案级说明：Loom 需要接管原子操作才能穷举调度交错，
// 因此在 `--cfg spark_loom` 下把 `ResumeGate` 的状态字切换为 Loom 实现；其余结构保持标准库/parking_lot。
#[cfg(not(any(loom, spark_loom)))]
use std::sync::atomic::{AtomicU8, Ordering};
#[cfg(any(loom, spark_loom))]
use loom::sync::atomic::{AtomicU8, Ordering};

use crate::{context::Context, error::CoroutineError, error::ResumeError};

/// 单次挂起实例的状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SuspensionState {
    Pending,
    Completing,
    Resumed,
}

impl SuspensionState {
    const PENDING: u8 = 0;
    const COMPLETING: u8 = 1;
    const RESUMED: u8 = 2;

    fn from_raw(raw: u8) -> Self {
        match raw {
            Self::PENDING => SuspensionState::Pending,
            Self::COMPLETING => SuspensionState::Completing,
            _ => SuspensionState::Resumed,
        }
    }
}

/// 三态恢复闸门：保证每个挂起实例只有一条线程进入 `Completing`。
///
/// # 教案式说明
/// - **意图 (Why)**：定时器线程、外部回调线程、卸载线程可能同时尝试完成同一挂起点；
///   必须由原子比较交换决出唯一胜者，否则结果会被覆盖或续体被重复调用。
/// - **逻辑 (How)**：`try_begin` 执行 `Pending -> Completing` 的 CAS，成功者随后调用 `finish`
///   推进到 `Resumed`；失败者得到 `false`，不得触碰结果槽。
/// - **契约 (What)**：
///   - `try_begin` 在整个生命周期内至多返回一次 `true`；
///   - `finish` 只能由 `try_begin` 的胜者调用，使用 `Release` 语义发布已写入的结果；
///   - `state` 使用 `Acquire` 读取，观察到 `Resumed` 后即可安全读取结果。
#[derive(Debug)]
pub struct ResumeGate {
    state: AtomicU8,
}

impl ResumeGate {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(SuspensionState::PENDING),
        }
    }

    /// 尝试赢得 `Pending -> Completing`。
    pub fn try_begin(&self) -> bool {
        self.state
            .compare_exchange(
                SuspensionState::PENDING,
                SuspensionState::COMPLETING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// 胜者完成交付，进入终态。
    pub fn finish(&self) {
        let previous = self.state.swap(SuspensionState::RESUMED, Ordering::AcqRel);
        debug_assert_eq!(
            previous,
            SuspensionState::COMPLETING,
            "finish called without winning try_begin"
        );
    }

    pub fn state(&self) -> SuspensionState {
        SuspensionState::from_raw(self.state.load(Ordering::Acquire))
    }
}

impl Default for ResumeGate {
    fn default() -> Self {
        Self::new()
    }
}

/// 挂起点与事件源之间共享的结果槽。
pub(crate) struct Slot<T> {
    gate: ResumeGate,
    outcome: Mutex<Option<Result<T, CoroutineError>>>,
    waker: AtomicWaker,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Self {
            gate: ResumeGate::new(),
            outcome: Mutex::new(None),
            waker: AtomicWaker::new(),
        }
    }

    fn deliver(&self, outcome: Result<T, CoroutineError>) -> Result<(), ResumeError<T>> {
        if !self.gate.try_begin() {
            return Err(ResumeError { outcome });
        }
        *self.outcome.lock() = Some(outcome);
        self.gate.finish();
        self.waker.wake();
        Ok(())
    }

    fn take(&self) -> Option<Result<T, CoroutineError>> {
        match self.gate.state() {
            SuspensionState::Resumed => self.outcome.lock().take(),
            _ => None,
        }
    }
}

pub(crate) type Sink<T> = Box<dyn FnOnce(Result<T, CoroutineError>) + Send + 'static>;

enum Target<T> {
    /// 由 `Continuation::new` 构造：恢复时执行回调，必要时经调度器转发。
    Callback(Sink<T>),
    /// 由 `suspend_coroutine` 构造：写入结果槽并唤醒挂起的任务；调度由任务的 waker 负责。
    Suspended(Arc<Slot<T>>),
}

/// 一次性续体。
///
/// # 教案式说明
/// - **意图 (Why)**：把“挂起点之后的剩余计算”表达为一个只能被消费一次的值，
///   所有权从挂起原语转移到事件源，并在恢复时被永久消耗。
/// - **逻辑 (How)**：
///   - `Continuation::new(context, sink)`：若 `context` 含调度器，`resume` 把 `sink(outcome)`
///     提交到调度器执行器；否则在调用线程就地执行；
///   - 由 [`suspend_coroutine`] 产生的续体写入结果槽并唤醒任务，任务的 waker 按同样规则路由；
///   - `Drop` 时若尚未恢复，则以 [`CoroutineError::Abandoned`] 自我恢复。
/// - **契约 (What)**：`resume` 可在任意线程调用；`T: Send` 保证结果可以跨线程移动。
pub struct Continuation<T: Send + 'static> {
    context: Context,
    target: Option<Target<T>>,
}

impl<T: Send + 'static> Continuation<T> {
    /// 以任意回调构造续体。
    pub fn new(
        context: Context,
        sink: impl FnOnce(Result<T, CoroutineError>) + Send + 'static,
    ) -> Self {
        Self {
            context,
            target: Some(Target::Callback(Box::new(sink))),
        }
    }

    fn suspended(context: Context, slot: Arc<Slot<T>>) -> Self {
        Self {
            context,
            target: Some(Target::Suspended(slot)),
        }
    }

    /// 续体的目标上下文。
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// 以成功或失败结果恢复续体。
    pub fn resume(mut self, outcome: Result<T, CoroutineError>) {
        if let Some(target) = self.target.take() {
            let context = std::mem::take(&mut self.context);
            deliver(context, target, outcome, true);
        }
    }

    /// 以成功值恢复。
    pub fn resume_with_value(self, value: T) {
        self.resume(Ok(value));
    }

    /// 以失败恢复。
    pub fn resume_with_error(self, error: CoroutineError) {
        self.resume(Err(error));
    }

    /// 跳过调度器，在当前线程直接交付；仅供已经运行在目标执行器上的任务终结路径使用。
    pub(crate) fn resume_in_place(mut self, outcome: Result<T, CoroutineError>) {
        if let Some(target) = self.target.take() {
            let context = std::mem::take(&mut self.context);
            deliver(context, target, outcome, false);
        }
    }

    /// 替换目标上下文，结果槽/回调保持不变。
    pub(crate) fn retarget(mut self, context: Context) -> Self {
        self.context = context;
        self
    }
}

fn deliver<T: Send + 'static>(
    context: Context,
    target: Target<T>,
    outcome: Result<T, CoroutineError>,
    intercept: bool,
) {
    tracing::trace!(
        success = outcome.is_ok(),
        coroutine = context.name().unwrap_or(""),
        "continuation resumed"
    );
    match target {
        Target::Suspended(slot) => {
            if let Err(rejected) = slot.deliver(outcome) {
                // 按值消费保证同一续体只会走到这里一次；出现即说明结果槽被其他途径提前写入。
                tracing::error!(
                    success = rejected.outcome.is_ok(),
                    "suspension slot already completed; dropping late outcome"
                );
            }
        }
        Target::Callback(sink) => match context.dispatcher() {
            Some(dispatcher) if intercept => dispatcher.dispatch_outcome(sink, outcome),
            _ => sink(outcome),
        },
    }
}

impl<T: Send + 'static> Drop for Continuation<T> {
    fn drop(&mut self) {
        if let Some(target) = self.target.take() {
            let context = std::mem::take(&mut self.context);
            tracing::debug!(
                coroutine = context.name().unwrap_or(""),
                "continuation dropped before resume"
            );
            deliver(context, target, Err(CoroutineError::Abandoned), true);
        }
    }
}

impl<T: Send + 'static> fmt::Debug for Continuation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.target {
            Some(Target::Callback(_)) => "callback",
            Some(Target::Suspended(_)) => "suspended",
            None => "consumed",
        };
        f.debug_struct("Continuation")
            .field("context", &self.context)
            .field("target", &kind)
            .finish()
    }
}

/// 可克隆的续体句柄，供可能多次触发的回调式事件源使用。
///
/// # 教案式说明
/// - **意图 (Why)**：外部 future 的完成回调通常是 `FnMut` 并可能被错误地调用两次；
///   需要一个可以在多处持有、但只有一次能真正恢复的句柄。
/// - **逻辑 (How)**：[`ResumeGate`] 决出胜者，胜者从槽中取出内部 [`Continuation`] 并消费它；
///   失败者拿回自己的结果（[`ResumeError`]），第一次交付的结果不受影响。
/// - **契约 (What)**：所有克隆都被丢弃而从未恢复时，内部续体随之被丢弃并以 `Abandoned` 自我恢复。
pub struct SharedContinuation<T: Send + 'static> {
    inner: Arc<SharedInner<T>>,
}

struct SharedInner<T: Send + 'static> {
    gate: ResumeGate,
    continuation: Mutex<Option<Continuation<T>>>,
}

impl<T: Send + 'static> SharedContinuation<T> {
    pub fn new(continuation: Continuation<T>) -> Self {
        Self {
            inner: Arc::new(SharedInner {
                gate: ResumeGate::new(),
                continuation: Mutex::new(Some(continuation)),
            }),
        }
    }

    /// 尝试恢复；只有第一次调用成功。
    pub fn try_resume(&self, outcome: Result<T, CoroutineError>) -> Result<(), ResumeError<T>> {
        if !self.inner.gate.try_begin() {
            return Err(ResumeError { outcome });
        }
        let continuation = self.inner.continuation.lock().take();
        self.inner.gate.finish();
        match continuation {
            Some(continuation) => {
                continuation.resume(outcome);
                Ok(())
            }
            None => Err(ResumeError { outcome }),
        }
    }

    pub fn state(&self) -> SuspensionState {
        self.inner.gate.state()
    }
}

impl<T: Send + 'static> Clone for SharedContinuation<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> fmt::Debug for SharedContinuation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedContinuation")
            .field("state", &self.state())
            .finish()
    }
}

/// 挂起当前协程，把续体交给 `register`，直到续体被恢复。
///
/// # 教案式说明
/// - **意图 (Why)**：所有挂起原语（`delay`、`await_completion`、`offload`）的共同底座。
/// - **逻辑 (How)**：首次轮询时创建结果槽，先登记 waker 再调用 `register`，
///   因此 `register` 内同步恢复也不会丢失唤醒；之后每次轮询检查槽是否进入 `Resumed`。
/// - **契约 (What)**：
///   - `register` 恰好被调用一次，且运行在发起挂起的线程上；
///   - 续体的上下文为 [`Context::current`]；
///   - 输出即续体收到的结果。
pub fn suspend_coroutine<T, R>(register: R) -> Suspend<T, R>
where
    T: Send + 'static,
    R: FnOnce(Continuation<T>),
{
    Suspend {
        register: Some(register),
        slot: None,
    }
}

/// [`suspend_coroutine`] 返回的 future。
#[must_use = "futures do nothing unless polled"]
pub struct Suspend<T: Send + 'static, R> {
    register: Option<R>,
    slot: Option<Arc<Slot<T>>>,
}

// 字段从不以 `Pin<&mut _>` 的形式暴露，移动 `Suspend` 不会破坏任何钉住保证。
impl<T: Send + 'static, R> Unpin for Suspend<T, R> {}

impl<T, R> Future for Suspend<T, R>
where
    T: Send + 'static,
    R: FnOnce(Continuation<T>),
{
    type Output = Result<T, CoroutineError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        if let Some(register) = this.register.take() {
            let slot = Arc::new(Slot::new());
            slot.waker.register(cx.waker());
            this.slot = Some(Arc::clone(&slot));
            register(Continuation::suspended(Context::current(), slot));
        }
        let Some(slot) = this.slot.as_ref() else {
            return Poll::Ready(Err(CoroutineError::Abandoned));
        };
        slot.waker.register(cx.waker());
        let outcome = slot.take();
        let resumed = slot.gate.state() == SuspensionState::Resumed;
        match outcome {
            Some(outcome) => {
                this.slot = None;
                Poll::Ready(outcome)
            }
            // 结果已被先前的轮询取走：future 在完成后又被轮询。
            None if resumed => Poll::Ready(Err(CoroutineError::Abandoned)),
            None => Poll::Pending,
        }
    }
}
