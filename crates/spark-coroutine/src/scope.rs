//! 协程作用域：携带上下文与失败上报器，负责发射（launch）独立协程。
//!
//! # 设计背景（Why）
//! - 服务端每收到一个请求就发射一个协程处理；发射点不等待结果，失败只能通过上报器观察；
//! - 调度器作为上下文元素由作用域显式携带，避免“全局默认调度器”这类隐式状态。
//!
//! # 契约说明（What）
//! - 作用域不跟踪已发射的协程，也不提供取消；
//! - 协程的输出通过 [`LaunchOutput`] 归一化：`()` 永不失败，`Result<(), E>` 在 `Err` 时失败；
//! - 失败与 panic 交给 [`FailureReporter`]，绝不回传到发射方。

use std::{fmt, future::Future, sync::Arc};

use crate::{
    context::Context,
    continuation::Continuation,
    dispatcher::Dispatcher,
    error::{BoxError, CoroutineError},
    executor::Executor,
    task::Task,
};

/// 发射协程失败时的上报契约。
pub trait FailureReporter: Send + Sync + 'static {
    /// `name` 来自协程上下文中的 [`CoroutineName`](crate::CoroutineName)。
    fn report(&self, name: Option<&str>, error: &CoroutineError);
}

/// 默认上报器：以 `error` 级别写入 `tracing`。
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingReporter;

impl FailureReporter for TracingReporter {
    fn report(&self, name: Option<&str>, error: &CoroutineError) {
        tracing::error!(
            coroutine = name.unwrap_or("<unnamed>"),
            panicked = error.is_panic(),
            error = %error,
            "launched coroutine failed"
        );
    }
}

/// 可被作用域发射的协程输出。
pub trait LaunchOutput: Send + 'static {
    fn into_outcome(self) -> Result<(), CoroutineError>;
}

impl LaunchOutput for () {
    fn into_outcome(self) -> Result<(), CoroutineError> {
        Ok(())
    }
}

impl<E> LaunchOutput for Result<(), E>
where
    E: Into<BoxError> + Send + 'static,
{
    fn into_outcome(self) -> Result<(), CoroutineError> {
        self.map_err(|error| {
            // 协程体内用 `?` 透传的运行时错误保持原样，其余错误包装为 `Failed`。
            let boxed: BoxError = error.into();
            match boxed.downcast::<CoroutineError>() {
                Ok(runtime) => *runtime,
                Err(other) => CoroutineError::Failed(other),
            }
        })
    }
}

/// 协程作用域。
///
/// # 教案式说明
/// - **意图 (Why)**：把“在哪里运行”（上下文中的调度器）和“失败告诉谁”（上报器）绑定在一起，
///   供请求处理等入口统一发射协程。
/// - **逻辑 (How)**：`launch` 以作用域上下文创建任务；首次轮询经调度器投递，因此发射线程不会执行协程体；
///   任务完成时终结续体把结果交给上报器。
/// - **契约 (What)**：终结续体的上下文不含调度器，失败在完成协程的线程上直接上报。
#[derive(Clone)]
pub struct Scope {
    context: Context,
    reporter: Arc<dyn FailureReporter>,
}

impl Scope {
    pub fn new(context: Context) -> Self {
        Self {
            context,
            reporter: Arc::new(TracingReporter),
        }
    }

    /// 替换失败上报器。
    pub fn with_reporter(mut self, reporter: Arc<dyn FailureReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// 发射一个独立协程。
    pub fn launch<F>(&self, future: F)
    where
        F: Future + Send + 'static,
        F::Output: LaunchOutput,
    {
        self.spawn(self.context.clone(), future);
    }

    /// 以“作用域上下文 + `extra`”发射协程，`extra` 中的同类元素优先。
    pub fn launch_with<F>(&self, extra: Context, future: F)
    where
        F: Future + Send + 'static,
        F::Output: LaunchOutput,
    {
        self.spawn(self.context.merge(&extra), future);
    }

    fn spawn<F>(&self, context: Context, future: F)
    where
        F: Future + Send + 'static,
        F::Output: LaunchOutput,
    {
        let reporter = Arc::clone(&self.reporter);
        let report_context = context.without::<Dispatcher>();
        let name = report_context.name().map(str::to_owned);
        let terminal = Continuation::new(
            report_context,
            move |outcome: Result<Result<(), CoroutineError>, CoroutineError>| {
                if let Err(error) = outcome.and_then(|inner| inner) {
                    reporter.report(name.as_deref(), &error);
                }
            },
        );
        Task::start(context, async move { future.await.into_outcome() }, terminal);
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

/// 以执行器构造作用域，上下文中包含新建的 [`Dispatcher`]。
pub fn scope(executor: Arc<dyn Executor>) -> Scope {
    Scope::new(Context::of(Dispatcher::new(executor)))
}
