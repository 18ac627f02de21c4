use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, error, warn};

use crate::error::{IntervalError, TimerError};

pub const DEFAULT_TIMER_NAME: &str = "chime interval timer";

pub type TimerCallback = Arc<dyn Fn(&TaskHandle) + Send + Sync>;

pub type TimerFactory = Box<dyn Fn() -> Arc<dyn TimerSource> + Send + Sync>;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Cancellation token for one armed task. Cancelled tasks may stay queued until their deadline;
/// the timer discards them when they surface.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: u64,
    cancelled: Arc<AtomicBool>,
}

impl TaskHandle {
    fn new() -> Self {
        Self {
            id: NEXT_TASK_ID.fetch_add(1, AtomicOrdering::Relaxed),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cancel(&self) -> bool {
        !self.cancelled.swap(true, AtomicOrdering::AcqRel)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(AtomicOrdering::Acquire)
    }
}

pub trait TimerSource: Send + Sync {
    fn arm(
        &self,
        delay: Duration,
        repeat: Option<Duration>,
        fixed_rate: bool,
        callback: TimerCallback,
    ) -> Result<TaskHandle, TimerError>;
}

/// A point on a timer's time axis. Offsets saturate so an oversized delay parks its task
/// instead of overflowing.
trait Deadline: Ord + Copy {
    fn after(self, offset: Duration) -> Self;
}

// About a century; still representable when added to any realistic `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

impl Deadline for Instant {
    fn after(self, offset: Duration) -> Self {
        self.checked_add(offset.min(FAR_FUTURE))
            .or_else(|| self.checked_add(Duration::from_secs(24 * 60 * 60)))
            .unwrap_or(self)
    }
}

impl Deadline for Duration {
    fn after(self, offset: Duration) -> Self {
        self.saturating_add(offset)
    }
}

struct Task {
    handle: TaskHandle,
    repeat: Option<Duration>,
    fixed_rate: bool,
    callback: TimerCallback,
}

impl Task {
    fn new(repeat: Option<Duration>, fixed_rate: bool, callback: TimerCallback) -> Self {
        Self {
            handle: TaskHandle::new(),
            repeat: repeat.filter(|period| !period.is_zero()),
            fixed_rate,
            callback,
        }
    }

    fn fire(&self) {
        let callback = &self.callback;
        let handle = &self.handle;
        if panic::catch_unwind(AssertUnwindSafe(|| callback(handle))).is_err() {
            error!(task = handle.id(), "timer task panicked");
        }
    }
}

struct Entry<D> {
    deadline: D,
    seq: u64,
    task: Task,
}

impl<D: Ord> PartialEq for Entry<D> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl<D: Ord> Eq for Entry<D> {}

impl<D: Ord> PartialOrd for Entry<D> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// BinaryHeap is a max-heap; invert so the earliest deadline surfaces first.
impl<D: Ord> Ord for Entry<D> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Queue<D> {
    entries: BinaryHeap<Entry<D>>,
    seq: u64,
    running: bool,
}

impl<D: Deadline> Queue<D> {
    fn new() -> Self {
        Self {
            entries: BinaryHeap::new(),
            seq: 0,
            running: true,
        }
    }

    fn push(&mut self, deadline: D, task: Task) {
        self.seq += 1;
        self.entries.push(Entry {
            deadline,
            seq: self.seq,
            task,
        });
    }

    fn pop_due(&mut self, now: D) -> Option<Entry<D>> {
        if self.entries.peek()?.deadline <= now {
            self.entries.pop()
        } else {
            None
        }
    }

    fn live_tasks(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| !entry.task.handle.is_cancelled())
            .count()
    }
}

pub struct ThreadTimer {
    shared: Arc<ThreadShared>,
}

struct ThreadShared {
    name: String,
    queue: Mutex<Queue<Instant>>,
    wakeup: Condvar,
}

impl ThreadTimer {
    pub fn start(name: impl Into<String>) -> Self {
        let shared = Arc::new(ThreadShared {
            name: name.into(),
            queue: Mutex::new(Queue::new()),
            wakeup: Condvar::new(),
        });
        let worker = Arc::clone(&shared);
        if let Err(err) = thread::Builder::new()
            .name(shared.name.clone())
            .spawn(move || run_thread(worker))
        {
            error!(name = %shared.name, %err, "unable to spawn timer thread");
            shared.queue.lock().running = false;
        }
        Self { shared }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn is_running(&self) -> bool {
        self.shared.queue.lock().running
    }

    pub fn live_tasks(&self) -> usize {
        self.shared.queue.lock().live_tasks()
    }

    pub fn shutdown(&self) {
        self.shared.stop();
    }
}

impl Drop for ThreadTimer {
    fn drop(&mut self) {
        self.shared.stop();
    }
}

impl TimerSource for ThreadTimer {
    fn arm(
        &self,
        delay: Duration,
        repeat: Option<Duration>,
        fixed_rate: bool,
        callback: TimerCallback,
    ) -> Result<TaskHandle, TimerError> {
        let task = Task::new(repeat, fixed_rate, callback);
        let handle = task.handle.clone();
        {
            let mut queue = self.shared.queue.lock();
            if !queue.running {
                return Err(TimerError::Unavailable);
            }
            queue.push(Instant::now().after(delay), task);
        }
        self.shared.wakeup.notify_one();
        Ok(handle)
    }
}

impl ThreadShared {
    fn stop(&self) {
        let drained = {
            let mut queue = self.queue.lock();
            queue.running = false;
            std::mem::take(&mut queue.entries)
        };
        self.wakeup.notify_all();
        drop(drained);
    }
}

struct StopOnExit(Arc<ThreadShared>);

impl Drop for StopOnExit {
    fn drop(&mut self) {
        debug!(name = %self.0.name, "timer thread exiting");
        self.0.stop();
    }
}

fn run_thread(shared: Arc<ThreadShared>) {
    let guard = StopOnExit(shared);
    let shared = &guard.0;
    loop {
        let entry = {
            let mut queue = shared.queue.lock();
            loop {
                if !queue.running {
                    return;
                }
                let now = Instant::now();
                if let Some(entry) = queue.pop_due(now) {
                    break entry;
                }
                match queue.entries.peek().map(|entry| entry.deadline) {
                    Some(deadline) => {
                        shared.wakeup.wait_until(&mut queue, deadline);
                    }
                    None => shared.wakeup.wait(&mut queue),
                }
            }
        };

        let Entry { deadline, task, .. } = entry;
        if task.handle.is_cancelled() {
            continue;
        }
        task.fire();

        let Some(period) = task.repeat else {
            continue;
        };
        if task.handle.is_cancelled() {
            continue;
        }
        let next = if task.fixed_rate {
            deadline.after(period)
        } else {
            Instant::now().after(period)
        };
        if next <= deadline {
            warn!(task = task.handle.id(), "repeat period out of range, dropping task");
            continue;
        }
        let mut queue = shared.queue.lock();
        if queue.running {
            queue.push(next, task);
        }
    }
}

/// Virtual-time timer driven by explicit calls to [`ManualTimer::advance`]. Callbacks run on the
/// advancing thread.
pub struct ManualTimer {
    state: Mutex<ManualState>,
}

struct ManualState {
    now: Duration,
    queue: Queue<Duration>,
}

impl ManualTimer {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ManualState {
                now: Duration::ZERO,
                queue: Queue::new(),
            }),
        }
    }

    pub fn now(&self) -> Duration {
        self.state.lock().now
    }

    pub fn live_tasks(&self) -> usize {
        self.state.lock().queue.live_tasks()
    }

    pub fn shutdown(&self) {
        let drained = {
            let mut state = self.state.lock();
            state.queue.running = false;
            std::mem::take(&mut state.queue.entries)
        };
        drop(drained);
    }

    /// Moves virtual time forward, firing every task that comes due in deadline order. Returns the
    /// number of callbacks invoked.
    pub fn advance(&self, by: Duration) -> usize {
        let target = self.state.lock().now.after(by);
        let mut fired = 0;
        loop {
            let entry = {
                let mut state = self.state.lock();
                match state.queue.pop_due(target) {
                    Some(entry) => {
                        state.now = state.now.max(entry.deadline);
                        entry
                    }
                    None => {
                        state.now = target;
                        break;
                    }
                }
            };

            let Entry { deadline, task, .. } = entry;
            if task.handle.is_cancelled() {
                continue;
            }
            task.fire();
            fired += 1;

            if let Some(period) = task.repeat {
                if task.handle.is_cancelled() {
                    continue;
                }
                let mut state = self.state.lock();
                let next = if task.fixed_rate {
                    deadline.after(period)
                } else {
                    state.now.after(period)
                };
                if next <= deadline {
                    warn!(task = task.handle.id(), "repeat period out of range, dropping task");
                    continue;
                }
                if state.queue.running {
                    state.queue.push(next, task);
                }
            }
        }
        fired
    }
}

impl Default for ManualTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerSource for ManualTimer {
    fn arm(
        &self,
        delay: Duration,
        repeat: Option<Duration>,
        fixed_rate: bool,
        callback: TimerCallback,
    ) -> Result<TaskHandle, TimerError> {
        let task = Task::new(repeat, fixed_rate, callback);
        let handle = task.handle.clone();
        let mut state = self.state.lock();
        if !state.queue.running {
            return Err(TimerError::Unavailable);
        }
        let deadline = state.now.after(delay);
        state.queue.push(deadline, task);
        Ok(handle)
    }
}

pub struct TimerHost {
    current: RwLock<Arc<dyn TimerSource>>,
    factory: TimerFactory,
}

impl TimerHost {
    pub fn new(initial: Arc<dyn TimerSource>, factory: TimerFactory) -> Self {
        Self {
            current: RwLock::new(initial),
            factory,
        }
    }

    pub fn threaded() -> Self {
        Self::new(
            Arc::new(ThreadTimer::start(DEFAULT_TIMER_NAME)),
            Box::new(|| -> Arc<dyn TimerSource> {
                Arc::new(ThreadTimer::start(DEFAULT_TIMER_NAME))
            }),
        )
    }

    pub fn current(&self) -> Arc<dyn TimerSource> {
        self.current.read().clone()
    }

    pub fn arm(
        &self,
        delay: Duration,
        repeat: Option<Duration>,
        fixed_rate: bool,
        callback: TimerCallback,
    ) -> Result<TaskHandle, IntervalError> {
        let timer = self.current();
        match timer.arm(delay, repeat, fixed_rate, Arc::clone(&callback)) {
            Ok(handle) => Ok(handle),
            Err(TimerError::Unavailable) => {
                // Concurrent callers may each install a timer here; the extra one only idles.
                warn!("recreating timer");
                let fresh = (self.factory)();
                *self.current.write() = Arc::clone(&fresh);
                fresh
                    .arm(delay, repeat, fixed_rate, callback)
                    .map_err(|err| {
                        error!(%err, "recreated timer rejected task");
                        IntervalError::TimerUnavailable
                    })
            }
        }
    }
}
