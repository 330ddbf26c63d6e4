#![deny(unsafe_code)]
#![doc = r#"
# spark-coroutine

## 设计动机（Why）
- **定位**：为同步代码与异步协程之间提供一层最小运行时：协程以一次性续体挂起，
  事件（定时器到期、外部回调、卸载线程完成）发生时恢复，恢复位置由上下文中的调度器决定；
- **架构角色**：服务端入口通过 [`Scope::launch`] 为每个请求发射协程，客户端调用点通过
  [`run_blocking`] 同步等待协程结果；
- **设计理念**：调度器、定时器、卸载策略都是 [`Context`] 元素，随协程显式流动，不依赖全局默认值。

## 核心契约（What）
- [`Continuation`] 按值消费，恢复恰好一次；被丢弃时以 [`CoroutineError::Abandoned`] 自我恢复；
- 上下文含 [`Dispatcher`] 时，每次恢复都投递到其执行器；否则在触发事件的线程上就地继续；
- 协程内的 panic 被捕获为 [`CoroutineError::Panicked`]，`run_blocking` 在调用线程上以原始载荷重新抛出；
- 执行器拒绝任务时响亮失败，不会悄悄丢失续体。

## 实现策略（How）
- 协程即 `Future`；任务驱动器（`task` 模块）用五态状态字保证同一协程不被并发轮询、轮询期间的唤醒不丢失；
- [`suspend_coroutine`] 是全部挂起原语的底座，[`ResumeGate`] 用 CAS 裁决多源竞争的恢复；
- 线程池、定时器、阻塞等待均基于 `parking_lot` 的锁与条件变量。

## 风险与考量（Trade-offs）
- 不提供取消、结构化并发与 select；
- [`offload`] 每次调用新建线程，适合低频阻塞操作，不适合高频小任务。
"#]

mod blocking;
mod config;
mod context;
mod continuation;
mod dispatcher;
mod error;
mod executor;
mod promise;
mod scope;
mod suspend;
mod task;
mod timer;

pub use blocking::{PendingWait, run_blocking, run_blocking_in, try_run_blocking, try_run_blocking_in};
pub use config::{OffloadConfig, PoolConfig, Runtime, RuntimeConfig, TimerConfig};
pub use context::{Context, CoroutineName, Element};
pub use continuation::{
    Continuation, ResumeGate, SharedContinuation, Suspend, SuspensionState, suspend_coroutine,
};
pub use dispatcher::{Dispatcher, dispatched};
pub use error::{BoxError, ConfigError, CoroutineError, ExecutorError, PanicPayload, ResumeError};
pub use executor::{Executor, Runnable, ThreadPool, ThreadPoolBuilder};
pub use promise::{CompletionCallback, CompletionSource, Promise};
pub use scope::{FailureReporter, LaunchOutput, Scope, TracingReporter, scope};
pub use suspend::{DELAY_RESUME_THREAD, OffloadPolicy, await_completion, delay, offload};
pub use timer::{DEFAULT_TIMER_THREAD, ThreadTimer, Timer, TimerHandle, TimerService};
