use std::sync::Arc;

use crate::dispatch::{Dispatcher, Inline};
use crate::interval::{Expire, Interval};
use crate::timer::{TimerHost, TimerSource};

#[derive(Clone)]
pub struct Clock {
    timers: Arc<TimerHost>,
    dispatcher: Arc<dyn Dispatcher>,
}

impl Clock {
    pub fn new(timers: TimerHost, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            timers: Arc::new(timers),
            dispatcher,
        }
    }

    pub fn threaded(dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self::new(TimerHost::threaded(), dispatcher)
    }

    /// Runs expirations directly on `timer`; recreation hands back the same source.
    pub fn inline(timer: Arc<dyn TimerSource>) -> Self {
        let replacement = Arc::clone(&timer);
        Self::new(
            TimerHost::new(timer, Box::new(move || Arc::clone(&replacement))),
            Arc::new(Inline),
        )
    }

    pub fn timers(&self) -> &Arc<TimerHost> {
        &self.timers
    }

    pub fn dispatcher(&self) -> &Arc<dyn Dispatcher> {
        &self.dispatcher
    }

    pub fn interval(&self, label: impl Into<String>, expire: impl Expire) -> Interval {
        Interval::new(
            label,
            Arc::clone(&self.timers),
            Arc::clone(&self.dispatcher),
            expire,
        )
    }

    pub fn interval_on(
        &self,
        label: impl Into<String>,
        dispatcher: Arc<dyn Dispatcher>,
        expire: impl Expire,
    ) -> Interval {
        Interval::new(label, Arc::clone(&self.timers), dispatcher, expire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::ManualTimer;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn intervals_share_the_clock_timer() {
        let timer = Arc::new(ManualTimer::new());
        let clock = Clock::inline(timer.clone());
        let count = Arc::new(AtomicUsize::new(0));

        let intervals: Vec<Interval> = (0..3)
            .map(|index| {
                let seen = Arc::clone(&count);
                let interval = clock.interval(format!("tick {index}"), move || {
                    seen.fetch_add(1, Ordering::SeqCst);
                });
                interval
                    .schedule(Duration::from_millis(10 * (index + 1)))
                    .unwrap();
                interval
            })
            .collect();

        assert_eq!(timer.live_tasks(), 3);
        timer.advance(Duration::from_millis(20));
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(intervals[2].is_scheduled());
    }
}
