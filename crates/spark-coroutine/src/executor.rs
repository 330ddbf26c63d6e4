//! 执行器抽象与固定大小线程池实现。
//!
//! # 设计背景（Why）
//! - 调度器只依赖“能提交任务、能关闭”的最小执行器契约，调用方可以接入自己的线程池；
//! - 运行时自带 [`ThreadPool`]，满足测试与中小规模服务的默认需求。
//!
//! # 契约说明（What）
//! - [`Executor::submit`] 必须线程安全；关闭后提交返回 [`ExecutorError::Shutdown`]；
//! - [`ThreadPool::shutdown`] 为优雅关闭：已入队的任务仍会执行完毕，新任务被拒绝；
//! - 任务内的 panic 被捕获并记录，工作线程不会因此退出。
//!
//! # 风险提示（Trade-offs）
//! - 单一 FIFO 队列 + 条件变量，没有工作窃取；在极高吞吐场景下队列锁可能成为热点。

use std::{
    collections::VecDeque,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread::{self, ThreadId},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::error::{ExecutorError, describe_panic};

/// 可提交给执行器的一次性任务。
pub type Runnable = Box<dyn FnOnce() + Send + 'static>;

/// 执行器契约。
///
/// # 契约说明（What）
/// - `submit`：入队任务；不得在调用线程上同步执行；
/// - `shutdown`：停止接收新任务，幂等；
/// - `is_shutdown`：是否已开始关闭；
/// - `name`：用于日志与诊断。
pub trait Executor: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn submit(&self, task: Runnable) -> Result<(), ExecutorError>;

    fn shutdown(&self);

    fn is_shutdown(&self) -> bool;
}

const DEFAULT_PREFIX: &str = "spark-coroutine-worker";

/// [`ThreadPool`] 构造器。
#[derive(Clone, Debug)]
pub struct ThreadPoolBuilder {
    threads: usize,
    name_prefix: String,
    stack_size: Option<usize>,
}

impl Default for ThreadPoolBuilder {
    fn default() -> Self {
        Self {
            threads: thread::available_parallelism().map_or(1, |n| n.get()),
            name_prefix: DEFAULT_PREFIX.to_owned(),
            stack_size: None,
        }
    }
}

impl ThreadPoolBuilder {
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    /// 工作线程名前缀，线程名为 `{prefix}-{index}`。
    pub fn name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    /// 启动所有工作线程。
    ///
    /// 任一线程创建失败时，已启动的线程会被关闭，并返回 [`ExecutorError::Spawn`]。
    pub fn build(self) -> Result<ThreadPool, ExecutorError> {
        let shared = Arc::new(PoolShared {
            name: self.name_prefix.clone(),
            queue: Mutex::new(PoolQueue {
                jobs: VecDeque::new(),
                shutdown: false,
                live_workers: 0,
            }),
            job_ready: Condvar::new(),
            terminated: Condvar::new(),
        });
        let mut workers = Vec::with_capacity(self.threads);
        for index in 0..self.threads {
            let mut builder = thread::Builder::new().name(format!("{}-{index}", self.name_prefix));
            if let Some(bytes) = self.stack_size {
                builder = builder.stack_size(bytes);
            }
            shared.queue.lock().live_workers += 1;
            let worker_shared = Arc::clone(&shared);
            match builder.spawn(move || worker_loop(&worker_shared)) {
                Ok(handle) => workers.push(handle.thread().id()),
                Err(err) => {
                    shared.queue.lock().live_workers -= 1;
                    shared.begin_shutdown();
                    return Err(ExecutorError::Spawn(err));
                }
            }
        }
        tracing::debug!(pool = %self.name_prefix, threads = self.threads, "thread pool started");
        Ok(ThreadPool { shared, workers })
    }
}

/// 固定大小线程池。
///
/// # 教案式说明
/// - **意图 (Why)**：为 [`Dispatcher`](crate::Dispatcher) 提供默认执行器，并能判断“当前线程是否属于本池”，
///   以便验证恢复确实落在池内线程上。
/// - **逻辑 (How)**：所有工作线程共享一个 `VecDeque` 队列；空闲线程在 `job_ready` 条件变量上阻塞等待，
///   关闭时广播唤醒，队列排空后线程退出并在 `terminated` 上通知。
/// - **契约 (What)**：`Drop` 触发优雅关闭但不等待线程退出；需要同步等待请调用 [`ThreadPool::await_termination`]。
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    workers: Vec<ThreadId>,
}

struct PoolShared {
    name: String,
    queue: Mutex<PoolQueue>,
    job_ready: Condvar,
    terminated: Condvar,
}

struct PoolQueue {
    jobs: VecDeque<Runnable>,
    shutdown: bool,
    live_workers: usize,
}

impl PoolShared {
    fn begin_shutdown(&self) -> bool {
        let mut queue = self.queue.lock();
        if queue.shutdown {
            return false;
        }
        queue.shutdown = true;
        drop(queue);
        self.job_ready.notify_all();
        true
    }
}

impl ThreadPool {
    /// 以默认线程名前缀创建 `threads` 个工作线程的线程池。
    pub fn new(threads: usize) -> Result<Self, ExecutorError> {
        Self::builder().threads(threads).build()
    }

    pub fn builder() -> ThreadPoolBuilder {
        ThreadPoolBuilder::default()
    }

    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    /// 当前线程是否为本池的工作线程。
    pub fn contains_current_thread(&self) -> bool {
        let current = thread::current().id();
        self.workers.contains(&current)
    }

    /// 阻塞等待所有工作线程退出，超时返回 `false`。
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut queue = self.shared.queue.lock();
        while queue.live_workers > 0 {
            if self
                .shared
                .terminated
                .wait_until(&mut queue, deadline)
                .timed_out()
            {
                return queue.live_workers == 0;
            }
        }
        true
    }

    /// 队列中尚未被取走的任务数。
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().jobs.len()
    }
}

impl Executor for ThreadPool {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn submit(&self, task: Runnable) -> Result<(), ExecutorError> {
        let mut queue = self.shared.queue.lock();
        if queue.shutdown {
            return Err(ExecutorError::shutdown(&self.shared.name));
        }
        queue.jobs.push_back(task);
        drop(queue);
        self.shared.job_ready.notify_one();
        Ok(())
    }

    fn shutdown(&self) {
        if self.shared.begin_shutdown() {
            tracing::debug!(pool = %self.shared.name, "thread pool shutting down");
        }
    }

    fn is_shutdown(&self) -> bool {
        self.shared.queue.lock().shutdown
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("name", &self.shared.name)
            .field("threads", &self.workers.len())
            .finish_non_exhaustive()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shared.begin_shutdown();
    }
}

fn worker_loop(shared: &PoolShared) {
    loop {
        let mut queue = shared.queue.lock();
        let job = loop {
            if let Some(job) = queue.jobs.pop_front() {
                break Some(job);
            }
            if queue.shutdown {
                break None;
            }
            shared.job_ready.wait(&mut queue);
        };
        drop(queue);
        let Some(job) = job else {
            break;
        };
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
            tracing::error!(
                pool = %shared.name,
                panic = %describe_panic(payload.as_ref()),
                "task panicked on worker thread"
            );
        }
    }
    let mut queue = shared.queue.lock();
    queue.live_workers -= 1;
    if queue.live_workers == 0 {
        shared.terminated.notify_all();
    }
    tracing::debug!(pool = %shared.name, "worker thread exited");
}
