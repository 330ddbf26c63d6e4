//! 运行时配置：从 TOML 读取线程池、定时器与卸载线程参数，并据此组装 [`Runtime`]。
//!
//! # 设计背景（Why）
//! - 线程数、线程名前缀这类部署参数需要随环境调整，而不是写死在代码里；
//! - 组装后的 [`Runtime`] 持有线程池与定时器的所有权，负责统一关闭。
//!
//! # 配置格式（What）
//! ```toml
//! [pool]
//! threads = 4
//! thread_name_prefix = "spark-coroutine-worker"
//!
//! [timer]
//! thread_name = "spark-coroutine-timer"
//!
//! [offload]
//! thread_name_prefix = "spark-offload"
//! stack_size = 2097152
//! ```
//! 所有字段都有默认值；未知字段视为错误，避免拼写错误被静默忽略。

use std::{future::Future, sync::Arc, thread, time::Duration};

use serde::Deserialize;

use crate::{
    blocking::run_blocking_in,
    context::Context,
    dispatcher::Dispatcher,
    error::ConfigError,
    executor::{Executor, ThreadPool},
    scope::Scope,
    suspend::OffloadPolicy,
    timer::{DEFAULT_TIMER_THREAD, ThreadTimer, TimerService},
};

/// 运行时配置根节点。
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    pub pool: PoolConfig,
    pub timer: TimerConfig,
    pub offload: OffloadConfig,
}

/// `[pool]`：调度器线程池。
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    pub threads: usize,
    pub thread_name_prefix: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            threads: thread::available_parallelism().map_or(1, |n| n.get()),
            thread_name_prefix: "spark-coroutine-worker".to_owned(),
        }
    }
}

/// `[timer]`：定时器线程。
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct TimerConfig {
    pub thread_name: String,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            thread_name: DEFAULT_TIMER_THREAD.to_owned(),
        }
    }
}

/// `[offload]`：卸载线程。
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct OffloadConfig {
    pub thread_name_prefix: String,
    pub stack_size: Option<usize>,
}

impl Default for OffloadConfig {
    fn default() -> Self {
        let policy = OffloadPolicy::default();
        Self {
            thread_name_prefix: policy.thread_name_prefix().to_owned(),
            stack_size: policy.stack_size(),
        }
    }
}

impl OffloadConfig {
    fn policy(&self) -> OffloadPolicy {
        let policy = OffloadPolicy::new(self.thread_name_prefix.clone());
        match self.stack_size {
            Some(bytes) => policy.with_stack_size(bytes),
            None => policy,
        }
    }
}

impl RuntimeConfig {
    /// 解析 TOML 文本并校验。
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// 校验字段取值。
    ///
    /// # 契约说明（What）
    /// - 线程数必须大于零；
    /// - 各线程名（前缀）不能为空；
    /// - 显式给出的卸载线程栈大小必须大于零。
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.threads == 0 {
            return Err(ConfigError::Invalid {
                field: "pool.threads",
                reason: "must be greater than zero",
            });
        }
        let names = [
            ("pool.thread_name_prefix", &self.pool.thread_name_prefix),
            ("timer.thread_name", &self.timer.thread_name),
            ("offload.thread_name_prefix", &self.offload.thread_name_prefix),
        ];
        for (field, value) in names {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must not be empty",
                });
            }
        }
        if self.offload.stack_size == Some(0) {
            return Err(ConfigError::Invalid {
                field: "offload.stack_size",
                reason: "must be greater than zero",
            });
        }
        Ok(())
    }

    /// 启动线程池与定时器，组装运行时。
    pub fn build(&self) -> Result<Runtime, ConfigError> {
        self.validate()?;
        let pool = Arc::new(
            ThreadPool::builder()
                .threads(self.pool.threads)
                .name_prefix(self.pool.thread_name_prefix.clone())
                .build()?,
        );
        let timer = Arc::new(ThreadTimer::start(self.timer.thread_name.clone())?);
        let context = Context::of(Dispatcher::new(pool.clone()))
            .with(TimerService::new(timer.clone()))
            .with(self.offload.policy());
        tracing::info!(
            threads = self.pool.threads,
            pool = %self.pool.thread_name_prefix,
            timer = %self.timer.thread_name,
            "coroutine runtime started"
        );
        Ok(Runtime {
            pool,
            timer,
            context,
        })
    }
}

/// 由 [`RuntimeConfig::build`] 组装的运行时。
///
/// # 教案式说明
/// - **意图 (Why)**：给服务入口一个“一站式”的对象：拿到作用域即可发射协程，拿到上下文即可阻塞桥接。
/// - **逻辑 (How)**：上下文同时携带调度器、定时器服务与卸载策略，协程内的 `delay`/`offload` 因此
///   使用本运行时的定时器线程与线程命名。
/// - **契约 (What)**：`shutdown` 之后新的发射以 `Rejected` 上报；`Drop` 只触发线程池的优雅关闭。
#[derive(Debug)]
pub struct Runtime {
    pool: Arc<ThreadPool>,
    timer: Arc<ThreadTimer>,
    context: Context,
}

impl Runtime {
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// 以默认失败上报器构造作用域。
    pub fn scope(&self) -> Scope {
        Scope::new(self.context.clone())
    }

    pub fn pool(&self) -> &Arc<ThreadPool> {
        &self.pool
    }

    pub fn timer(&self) -> &Arc<ThreadTimer> {
        &self.timer
    }

    /// 在本运行时的线程池上运行协程并阻塞等待结果。
    pub fn run_blocking<F>(&self, future: F) -> F::Output
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        run_blocking_in(self.context.clone(), future)
    }

    /// 关闭线程池与定时器，并在 `timeout` 内等待工作线程退出；全部退出返回 `true`。
    ///
    /// 仍挂在定时器上的协程以 `Abandoned` 恢复。
    pub fn shutdown(&self, timeout: Duration) -> bool {
        self.pool.shutdown();
        self.timer.shutdown();
        let drained = self.pool.await_termination(timeout);
        tracing::info!(drained, "coroutine runtime stopped");
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = RuntimeConfig::from_toml_str("").expect("defaults");
        assert_eq!(config, RuntimeConfig::default());
        assert_eq!(config.offload.thread_name_prefix, "spark-offload");
        assert!(config.pool.threads >= 1);
    }

    #[test]
    fn zero_threads_is_rejected() {
        let err = RuntimeConfig::from_toml_str("[pool]\nthreads = 0\n").expect_err("invalid");
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "pool.threads",
                ..
            }
        ));
    }

    #[test]
    fn unknown_field_is_a_parse_error() {
        let err = RuntimeConfig::from_toml_str("[pool]\nthread = 2\n").expect_err("typo");
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
