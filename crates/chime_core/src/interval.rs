use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::dispatch::{Dispatcher, Work};
use crate::error::IntervalError;
use crate::timer::{TaskHandle, TimerCallback, TimerHost};

pub trait Expire: Send + Sync + 'static {
    fn expired(&self);
}

impl<F> Expire for F
where
    F: Fn() + Send + Sync + 'static,
{
    fn expired(&self) {
        self()
    }
}

#[derive(Clone)]
pub struct Interval {
    shared: Arc<IntervalShared>,
}

#[derive(Clone)]
pub struct WeakInterval {
    shared: Weak<IntervalShared>,
}

struct IntervalShared {
    label: String,
    expire: Box<dyn Expire>,
    dispatcher: Arc<dyn Dispatcher>,
    timers: Arc<TimerHost>,
    // Bumped on every schedule and cancel; a firing only runs while its generation is current.
    generation: AtomicU64,
    active: Mutex<Option<TaskHandle>>,
}

impl Interval {
    pub fn new(
        label: impl Into<String>,
        timers: Arc<TimerHost>,
        dispatcher: Arc<dyn Dispatcher>,
        expire: impl Expire,
    ) -> Self {
        Self {
            shared: Arc::new(IntervalShared {
                label: label.into(),
                expire: Box::new(expire),
                dispatcher,
                timers,
                generation: AtomicU64::new(0),
                active: Mutex::new(None),
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    pub fn downgrade(&self) -> WeakInterval {
        WeakInterval {
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn ptr_eq(&self, other: &Interval) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub fn is_scheduled(&self) -> bool {
        self.shared.active.lock().is_some()
    }

    pub fn schedule(&self, delay: Duration) -> Result<(), IntervalError> {
        self.schedule_with(delay, Duration::ZERO, true)
    }

    pub fn schedule_at(&self, when: DateTime<Utc>) -> Result<(), IntervalError> {
        let delay = (when - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        self.schedule(delay)
    }

    pub fn schedule_repeating(&self, period: Duration) -> Result<(), IntervalError> {
        self.schedule_with(period, period, true)
    }

    /// Supersedes any earlier schedule. A zero `repeat` expires once. Fixed-delay repeats
    /// (`fixed_rate == false`) are only accepted on an inline dispatcher.
    pub fn schedule_with(
        &self,
        initial: Duration,
        repeat: Duration,
        fixed_rate: bool,
    ) -> Result<(), IntervalError> {
        let repeat = (!repeat.is_zero()).then_some(repeat);
        if repeat.is_some() && !fixed_rate && !self.shared.dispatcher.is_inline() {
            return Err(IntervalError::FixedDelayRequiresInline);
        }

        let mut active = self.shared.active.lock();
        if let Some(previous) = active.take() {
            previous.cancel();
        }
        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let callback = timer_callback(Arc::downgrade(&self.shared), generation, repeat.is_some());
        let handle = self.shared.timers.arm(initial, repeat, fixed_rate, callback)?;
        debug!(
            interval = %self.shared.label,
            generation,
            ?initial,
            ?repeat,
            fixed_rate,
            "interval scheduled"
        );
        *active = Some(handle);
        Ok(())
    }

    /// Invalidates the current task. Safe to call at any time; an expiration already running
    /// completes, but nothing queued behind it will run. Returns whether a task was active.
    pub fn cancel(&self) -> bool {
        self.shared.cancel()
    }
}

impl fmt::Debug for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interval")
            .field("label", &self.shared.label)
            .field("generation", &self.shared.generation.load(Ordering::Acquire))
            .field("scheduled", &self.is_scheduled())
            .finish()
    }
}

impl WeakInterval {
    pub fn upgrade(&self) -> Option<Interval> {
        self.shared.upgrade().map(|shared| Interval { shared })
    }
}

impl IntervalShared {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) == generation
    }

    fn cancel(&self) -> bool {
        let mut active = self.active.lock();
        self.generation.fetch_add(1, Ordering::AcqRel);
        match active.take() {
            Some(task) => {
                task.cancel();
                true
            }
            None => false,
        }
    }

    fn cancel_generation(&self, generation: u64) {
        let mut active = self.active.lock();
        if self.is_current(generation) {
            self.generation.fetch_add(1, Ordering::AcqRel);
            if let Some(task) = active.take() {
                task.cancel();
            }
        }
    }

    fn retire(&self, generation: u64) {
        let mut active = self.active.lock();
        if self.is_current(generation) {
            active.take();
        }
    }

    fn safely_expire(&self, generation: u64, task: &TaskHandle, repeating: bool) {
        if !self.is_current(generation) {
            // A schedule() racing a cancel() can leave a live task nobody references; make sure
            // it stops here.
            task.cancel();
            debug!(interval = %self.label, generation, "dropping stale expiration");
            return;
        }
        if !repeating {
            self.retire(generation);
        }
        if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| self.expire.expired())) {
            error!(
                interval = %self.label,
                reason = %panic_message(panic.as_ref()),
                "interval broken in expired()"
            );
        }
    }
}

impl Drop for IntervalShared {
    fn drop(&mut self) {
        if let Some(task) = self.active.get_mut().take() {
            task.cancel();
        }
    }
}

fn timer_callback(
    interval: Weak<IntervalShared>,
    generation: u64,
    repeating: bool,
) -> TimerCallback {
    Arc::new(move |task: &TaskHandle| {
        let Some(shared) = interval.upgrade() else {
            task.cancel();
            return;
        };
        if !shared.is_current(generation) {
            task.cancel();
            debug!(interval = %shared.label, generation, "dropping stale timer firing");
            return;
        }

        let expiration = PostedExpiration {
            target: Arc::downgrade(&shared),
            generation,
            task: task.clone(),
            repeating,
            ran: false,
        };
        let work: Work = Box::new(move || expiration.run());
        if let Err(err) = shared.dispatcher.post(work) {
            warn!(interval = %shared.label, %err, "interval posted to closed dispatcher, cancelling");
            shared.cancel_generation(generation);
        }
    })
}

/// One firing handed to the dispatcher. A dispatcher that drops it unrun has discarded the
/// expiration, so the generation it was armed for is cancelled.
struct PostedExpiration {
    target: Weak<IntervalShared>,
    generation: u64,
    task: TaskHandle,
    repeating: bool,
    ran: bool,
}

impl PostedExpiration {
    fn run(mut self) {
        self.ran = true;
        if let Some(shared) = self.target.upgrade() {
            shared.safely_expire(self.generation, &self.task, self.repeating);
        }
    }
}

impl Drop for PostedExpiration {
    fn drop(&mut self) {
        if self.ran {
            return;
        }
        if let Some(shared) = self.target.upgrade() {
            debug!(interval = %shared.label, generation = self.generation, "expiration discarded");
            shared.cancel_generation(self.generation);
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{Inline, RunQueue};
    use crate::timer::{ManualTimer, TimerSource};
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    struct Fixture {
        timer: Arc<ManualTimer>,
        host: Arc<TimerHost>,
    }

    impl Fixture {
        fn new() -> Self {
            let timer = Arc::new(ManualTimer::new());
            let source: Arc<dyn TimerSource> = timer.clone();
            let host = Arc::new(TimerHost::new(
                source.clone(),
                Box::new(move || source.clone()),
            ));
            Self { timer, host }
        }

        fn counting(&self, dispatcher: Arc<dyn Dispatcher>) -> (Interval, Arc<AtomicUsize>) {
            let count = Arc::new(AtomicUsize::new(0));
            let seen = Arc::clone(&count);
            let interval = Interval::new("test", self.host.clone(), dispatcher, move || {
                seen.fetch_add(1, Ordering::SeqCst);
            });
            (interval, count)
        }

        fn advance(&self, millis: u64) {
            self.timer.advance(Duration::from_millis(millis));
        }
    }

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    #[test]
    fn one_shot_expires_once() {
        let fixture = Fixture::new();
        let (interval, count) = fixture.counting(Arc::new(Inline));
        interval.schedule(ms(100)).unwrap();
        assert!(interval.is_scheduled());

        fixture.advance(99);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        fixture.advance(1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        fixture.advance(1_000);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!interval.is_scheduled());
    }

    #[test]
    fn rescheduling_suppresses_the_earlier_firing() {
        let fixture = Fixture::new();
        let (interval, count) = fixture.counting(Arc::new(Inline));
        interval.schedule(ms(100)).unwrap();
        fixture.advance(50);
        interval.schedule(ms(100)).unwrap();

        fixture.advance(60);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        fixture.advance(40);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn queued_stale_expiration_is_dropped() {
        let fixture = Fixture::new();
        let queue = Arc::new(RunQueue::new("frame"));
        let (interval, count) = fixture.counting(queue.clone());
        interval.schedule(ms(10)).unwrap();
        fixture.advance(10);
        assert_eq!(queue.len(), 1);

        interval.schedule(ms(100)).unwrap();
        assert_eq!(queue.run_pending(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(interval.is_scheduled());
    }

    #[test]
    fn cancel_during_expiration_lets_it_finish_and_stops_repeats() {
        let fixture = Fixture::new();
        let queue = Arc::new(RunQueue::new("frame"));
        let count = Arc::new(AtomicUsize::new(0));
        let handle: Arc<Mutex<Option<WeakInterval>>> = Arc::new(Mutex::new(None));

        let seen = Arc::clone(&count);
        let slot = Arc::clone(&handle);
        let interval = Interval::new("self-cancel", fixture.host.clone(), queue.clone(), move || {
            if let Some(interval) = slot.lock().as_ref().and_then(WeakInterval::upgrade) {
                interval.cancel();
            }
            seen.fetch_add(1, Ordering::SeqCst);
        });
        *handle.lock() = Some(interval.downgrade());

        interval.schedule_repeating(ms(10)).unwrap();
        fixture.advance(10);
        queue.run_pending();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        fixture.advance(100);
        queue.run_pending();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(fixture.timer.live_tasks(), 0);
    }

    #[test]
    fn fixed_rate_repeats_and_catches_up() {
        let fixture = Fixture::new();
        let (interval, count) = fixture.counting(Arc::new(Inline));
        interval.schedule_with(ms(10), ms(10), true).unwrap();
        fixture.advance(35);
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(interval.is_scheduled());
    }

    #[test]
    fn fixed_delay_requires_inline_dispatch() {
        let fixture = Fixture::new();
        let (queued, _) = fixture.counting(Arc::new(RunQueue::new("frame")));
        assert_eq!(
            queued.schedule_with(ms(10), ms(10), false).unwrap_err(),
            IntervalError::FixedDelayRequiresInline
        );
        assert!(queued.schedule_with(ms(10), Duration::ZERO, false).is_ok());

        let (inline, count) = fixture.counting(Arc::new(Inline));
        inline.schedule_with(ms(10), ms(20), false).unwrap();
        fixture.advance(50);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn panicking_expiration_does_not_stop_repeats() {
        let fixture = Fixture::new();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let interval = Interval::new("flaky", fixture.host.clone(), Arc::new(Inline), move || {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("first expiration fails");
            }
        });
        interval.schedule_repeating(ms(10)).unwrap();
        fixture.advance(30);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn closed_dispatcher_cancels_the_interval() {
        let fixture = Fixture::new();
        let queue = Arc::new(RunQueue::new("frame"));
        let (interval, count) = fixture.counting(queue.clone());
        interval.schedule_repeating(ms(10)).unwrap();
        queue.close();

        fixture.advance(10);
        assert!(!interval.is_scheduled());
        fixture.advance(100);
        assert_eq!(queue.run_pending(), 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn discarded_expiration_unschedules_the_interval() {
        let fixture = Fixture::new();
        let queue = Arc::new(RunQueue::new("frame"));
        let (interval, count) = fixture.counting(queue.clone());
        interval.schedule(ms(10)).unwrap();
        fixture.advance(10);
        assert_eq!(queue.len(), 1);
        assert!(interval.is_scheduled());

        queue.close();
        assert!(!interval.is_scheduled());
        assert_eq!(count.load(Ordering::SeqCst), 0);

        interval.schedule(ms(10)).unwrap();
        fixture.advance(10);
        assert!(!interval.is_scheduled());
    }

    #[test]
    fn huge_delay_stays_scheduled() {
        let fixture = Fixture::new();
        let (interval, count) = fixture.counting(Arc::new(Inline));
        interval.schedule(Duration::MAX).unwrap();
        fixture.advance(60_000);
        assert!(interval.is_scheduled());
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(interval.cancel());
    }

    #[test]
    fn cancel_is_idempotent() {
        let fixture = Fixture::new();
        let (interval, count) = fixture.counting(Arc::new(Inline));
        assert!(!interval.cancel());
        interval.schedule(ms(5)).unwrap();
        assert!(interval.cancel());
        assert!(!interval.cancel());
        fixture.advance(10);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dropping_the_interval_cancels_its_task() {
        let fixture = Fixture::new();
        let (interval, count) = fixture.counting(Arc::new(Inline));
        interval.schedule_repeating(ms(10)).unwrap();
        assert_eq!(fixture.timer.live_tasks(), 1);
        drop(interval);
        assert_eq!(fixture.timer.live_tasks(), 0);
        fixture.advance(50);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn recreates_a_dead_timer_when_scheduling() {
        let dead = Arc::new(ManualTimer::new());
        dead.shutdown();
        let fresh = Arc::new(ManualTimer::new());
        let replacement = fresh.clone();
        let host = Arc::new(TimerHost::new(
            dead,
            Box::new(move || -> Arc<dyn TimerSource> { replacement.clone() }),
        ));
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let interval = Interval::new("recreated", host, Arc::new(Inline), move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        interval.schedule(ms(5)).unwrap();
        fresh.advance(ms(5));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_schedule_and_cancel_leave_no_runaway_task() {
        let fixture = Fixture::new();
        let (interval, count) = fixture.counting(Arc::new(Inline));
        thread::scope(|scope| {
            for worker in 0..4 {
                let interval = interval.clone();
                scope.spawn(move || {
                    for round in 0..200 {
                        if (worker + round) % 3 == 0 {
                            interval.cancel();
                        } else {
                            interval.schedule_repeating(ms(10)).unwrap();
                        }
                    }
                });
            }
        });
        interval.cancel();
        assert_eq!(fixture.timer.live_tasks(), 0);
        fixture.advance(1_000);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn schedule_at_past_time_expires_immediately() {
        let fixture = Fixture::new();
        let (interval, count) = fixture.counting(Arc::new(Inline));
        interval
            .schedule_at(Utc::now() - chrono::Duration::seconds(5))
            .unwrap();
        fixture.advance(0);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
