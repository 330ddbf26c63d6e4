//! 定时器抽象与单线程定时器实现。
//!
//! # 设计背景（Why）
//! - `delay` 需要“到期后回调一次”的能力，且回调线程必须独立于任何调度器线程池，
//!   否则池被占满时定时器也会停摆；
//! - 抽象为 [`Timer`] Trait，便于测试注入或接入宿主已有的时间轮。
//!
//! # 逻辑解析（How）
//! - [`ThreadTimer`] 持有一条专用线程和按截止时间排序的最小堆；
//!   线程在条件变量上 `wait_until` 最近的截止点，新登记更早的条目时被唤醒重新计算。
//!
//! # 契约说明（What）
//! - 回调在截止时间之后执行，不早于 `now + delay`；
//! - 截止时间无法表示（`delay` 过大）时登记失败，返回 [`ExecutorError::DeadlineOverflow`]；
//! - [`TimerHandle::cancel`] 只阻止尚未执行的回调；
//! - `shutdown` 丢弃所有未到期条目，其中携带的续体随之以 `Abandoned` 自我恢复。

use std::{
    cmp::Ordering as CmpOrdering,
    collections::BinaryHeap,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::{
    context::Element,
    error::{ExecutorError, describe_panic},
    executor::Runnable,
};

/// 默认定时器线程名。
pub const DEFAULT_TIMER_THREAD: &str = "spark-coroutine-timer";

/// 定时调度契约。
pub trait Timer: Send + Sync + 'static {
    /// 在 `delay` 之后执行 `task`。
    fn schedule(&self, delay: Duration, task: Runnable) -> Result<TimerHandle, ExecutorError>;
}

/// 可取消的定时句柄。丢弃句柄不会取消任务。
#[derive(Clone, Debug)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// 取消尚未执行的任务；首次取消返回 `true`。
    pub fn cancel(&self) -> bool {
        !self.cancelled.swap(true, Ordering::AcqRel)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

struct TimerEntry {
    deadline: Instant,
    sequence: u64,
    task: Runnable,
    handle: TimerHandle,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    // `BinaryHeap` 是最大堆，反转比较使最早截止的条目位于堆顶；同一截止点按登记顺序执行。
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

struct TimerQueue {
    entries: BinaryHeap<TimerEntry>,
    next_sequence: u64,
    shutdown: bool,
}

struct TimerShared {
    name: String,
    queue: Mutex<TimerQueue>,
    wakeup: Condvar,
}

/// 单线程定时器。
pub struct ThreadTimer {
    shared: Arc<TimerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

static SHARED_TIMER: Mutex<Option<Arc<ThreadTimer>>> = parking_lot::const_mutex(None);

impl ThreadTimer {
    /// 以指定线程名启动定时器线程。
    pub fn start(name: impl Into<String>) -> Result<Self, ExecutorError> {
        let name = name.into();
        let shared = Arc::new(TimerShared {
            name: name.clone(),
            queue: Mutex::new(TimerQueue {
                entries: BinaryHeap::new(),
                next_sequence: 0,
                shutdown: false,
            }),
            wakeup: Condvar::new(),
        });
        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || timer_loop(&thread_shared))?;
        tracing::debug!(timer = %name, "timer thread started");
        Ok(Self {
            shared,
            thread: Mutex::new(Some(handle)),
        })
    }

    /// 进程级默认定时器，首次调用时惰性启动；关闭后再次调用会重新启动一个新实例。
    pub fn shared() -> Result<Arc<ThreadTimer>, ExecutorError> {
        let mut slot = SHARED_TIMER.lock();
        if let Some(timer) = slot.as_ref().filter(|timer| !timer.is_shutdown()) {
            return Ok(Arc::clone(timer));
        }
        let timer = Arc::new(ThreadTimer::start(DEFAULT_TIMER_THREAD)?);
        *slot = Some(Arc::clone(&timer));
        Ok(timer)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// 尚未执行（含已取消但未出堆）的条目数。
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().entries.len()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.queue.lock().shutdown
    }

    /// 停止定时器线程并丢弃所有未到期条目；会等待定时器线程退出（在定时器线程自身上调用时除外）。
    pub fn shutdown(&self) {
        let dropped = {
            let mut queue = self.shared.queue.lock();
            if queue.shutdown {
                return;
            }
            queue.shutdown = true;
            std::mem::take(&mut queue.entries)
        };
        self.shared.wakeup.notify_all();
        tracing::debug!(timer = %self.shared.name, dropped = dropped.len(), "timer shutting down");
        // 在锁外释放条目：条目中的续体在 Drop 时会回调，可能再次访问定时器。
        drop(dropped);
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                tracing::error!(timer = %self.shared.name, "timer thread terminated abnormally");
            }
        }
    }
}

impl Timer for ThreadTimer {
    fn schedule(&self, delay: Duration, task: Runnable) -> Result<TimerHandle, ExecutorError> {
        let deadline = Instant::now()
            .checked_add(delay)
            .ok_or(ExecutorError::DeadlineOverflow { delay })?;
        let handle = TimerHandle::new();
        let mut queue = self.shared.queue.lock();
        if queue.shutdown {
            return Err(ExecutorError::shutdown(&self.shared.name));
        }
        let sequence = queue.next_sequence;
        queue.next_sequence += 1;
        let becomes_head = queue
            .entries
            .peek()
            .is_none_or(|head| deadline < head.deadline);
        queue.entries.push(TimerEntry {
            deadline,
            sequence,
            task,
            handle: handle.clone(),
        });
        drop(queue);
        if becomes_head {
            self.shared.wakeup.notify_one();
        }
        Ok(handle)
    }
}

impl Drop for ThreadTimer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for ThreadTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadTimer")
            .field("name", &self.shared.name)
            .finish_non_exhaustive()
    }
}

fn timer_loop(shared: &TimerShared) {
    let mut queue = shared.queue.lock();
    loop {
        if queue.shutdown {
            break;
        }
        let now = Instant::now();
        match queue.entries.peek().map(|head| head.deadline) {
            None => shared.wakeup.wait(&mut queue),
            Some(deadline) if deadline > now => {
                shared.wakeup.wait_until(&mut queue, deadline);
            }
            Some(_) => {
                let Some(entry) = queue.entries.pop() else {
                    continue;
                };
                if entry.handle.is_cancelled() {
                    continue;
                }
                drop(queue);
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(entry.task)) {
                    tracing::error!(
                        timer = %shared.name,
                        panic = %describe_panic(payload.as_ref()),
                        "timer task panicked"
                    );
                }
                queue = shared.queue.lock();
            }
        }
    }
    drop(queue);
    tracing::debug!(timer = %shared.name, "timer thread exited");
}

/// 上下文中的定时器元素；`delay` 优先使用它，缺省时回落到 [`ThreadTimer::shared`]。
#[derive(Clone)]
pub struct TimerService {
    timer: Arc<dyn Timer>,
}

impl TimerService {
    pub fn new(timer: Arc<dyn Timer>) -> Self {
        Self { timer }
    }

    pub fn timer(&self) -> &Arc<dyn Timer> {
        &self.timer
    }
}

impl Element for TimerService {}

impl fmt::Debug for TimerService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TimerService")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn fires_in_deadline_order_on_timer_thread() {
        let timer = ThreadTimer::start("order-timer").expect("timer");
        let (tx, rx) = mpsc::channel();
        for (label, millis) in [("late", 40_u64), ("early", 5), ("middle", 20)] {
            let tx = tx.clone();
            timer
                .schedule(
                    Duration::from_millis(millis),
                    Box::new(move || {
                        tx.send((label, thread::current().name().map(str::to_owned)))
                            .ok();
                    }),
                )
                .expect("scheduled");
        }
        let fired: Vec<_> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).expect("fired"))
            .collect();
        let labels: Vec<_> = fired.iter().map(|(label, _)| *label).collect();
        assert_eq!(labels, ["early", "middle", "late"]);
        assert!(fired
            .iter()
            .all(|(_, name)| name.as_deref() == Some("order-timer")));
    }

    #[test]
    fn cancelled_entries_never_run() {
        let timer = ThreadTimer::start("cancel-timer").expect("timer");
        let (tx, rx) = mpsc::channel::<()>();
        let handle = timer
            .schedule(
                Duration::from_millis(20),
                Box::new(move || {
                    tx.send(()).ok();
                }),
            )
            .expect("scheduled");
        assert!(handle.cancel());
        assert!(!handle.cancel(), "重复取消返回 false");
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn shutdown_rejects_new_entries() {
        let timer = ThreadTimer::start("closing-timer").expect("timer");
        timer.shutdown();
        assert!(matches!(
            timer.schedule(Duration::ZERO, Box::new(|| {})),
            Err(ExecutorError::Shutdown { .. })
        ));
    }

    #[test]
    fn unrepresentable_deadline_is_refused() {
        let timer = ThreadTimer::start("overflow-timer").expect("timer");
        let refused = timer.schedule(Duration::MAX, Box::new(|| {}));
        assert!(matches!(
            refused,
            Err(ExecutorError::DeadlineOverflow { delay }) if delay == Duration::MAX
        ));
        assert_eq!(timer.pending(), 0);
        timer
            .schedule(Duration::from_millis(1), Box::new(|| {}))
            .expect("timer keeps accepting entries");
    }
}
