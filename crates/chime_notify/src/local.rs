use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use chime_core::{Clock, Interval};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::adapter::{AdapterHandle, DeliveryAdapter, Notification};
use crate::error::AdapterError;
use crate::registry::DeliverySink;

type ForegroundProbe = Arc<dyn Fn() -> bool + Send + Sync>;
type ArmedIntervals = Mutex<HashMap<i32, Interval>>;

/// Desktop delivery adapter: one [`Interval`] per armed id, logging the notification when it
/// fires. Timers live in process memory, so ids restored after a restart cannot be re-armed.
pub struct IntervalAdapter {
    clock: Clock,
    sink: OnceLock<DeliverySink>,
    armed: Arc<ArmedIntervals>,
    foreground: ForegroundProbe,
}

impl IntervalAdapter {
    pub fn new(clock: Clock) -> Self {
        Self {
            clock,
            sink: OnceLock::new(),
            armed: Arc::new(Mutex::new(HashMap::new())),
            foreground: Arc::new(|| true),
        }
    }

    pub fn with_foreground_probe(mut self, probe: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.foreground = Arc::new(probe);
        self
    }

    pub fn armed_ids(&self) -> Vec<i32> {
        let mut ids: Vec<i32> = self.armed.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

impl DeliveryAdapter for IntervalAdapter {
    fn attach(&self, sink: DeliverySink) {
        if self.sink.set(sink).is_err() {
            debug!("interval adapter already attached");
        }
    }

    fn arm(
        &self,
        id: i32,
        fire_at: DateTime<Utc>,
        payload: Notification,
    ) -> Result<Box<dyn AdapterHandle>, AdapterError> {
        let sink = self.sink.get().cloned().ok_or(AdapterError::Detached)?;
        let armed = Arc::downgrade(&self.armed);
        let foreground = Arc::clone(&self.foreground);

        let interval = self
            .clock
            .interval(format!("notification {id}"), move || {
                if let Some(armed) = armed.upgrade() {
                    armed.lock().remove(&id);
                }
                info!(id, text = ?payload.message, "notification shown");
                sink.on_fire(id, payload.clone(), foreground());
            });
        // Registered before arming so a zero-delay firing finds its own entry to clear.
        if let Some(previous) = self.armed.lock().insert(id, interval.clone()) {
            previous.cancel();
        }
        let delay = (fire_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        if let Err(err) = interval.schedule(delay) {
            let mut armed = self.armed.lock();
            if armed.get(&id).is_some_and(|current| current.ptr_eq(&interval)) {
                armed.remove(&id);
            }
            return Err(err.into());
        }
        debug!(id, ?delay, "scheduling notification");
        Ok(Box::new(IntervalHandle {
            id,
            interval,
            armed: Arc::downgrade(&self.armed),
        }))
    }

    fn cancel_id(&self, id: i32) -> bool {
        let interval = self.armed.lock().remove(&id);
        match interval {
            Some(interval) => interval.cancel(),
            None => false,
        }
    }
}

struct IntervalHandle {
    id: i32,
    interval: Interval,
    armed: Weak<ArmedIntervals>,
}

impl AdapterHandle for IntervalHandle {
    fn cancel(&self) -> bool {
        if let Some(armed) = self.armed.upgrade() {
            let mut armed = armed.lock();
            if armed
                .get(&self.id)
                .is_some_and(|current| current.ptr_eq(&self.interval))
            {
                armed.remove(&self.id);
            }
        }
        self.interval.cancel()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::NotificationsBuilder;
    use chime_core::ManualTimer;

    fn adapter_on(timer: &Arc<ManualTimer>) -> Arc<IntervalAdapter> {
        Arc::new(IntervalAdapter::new(Clock::inline(timer.clone())).with_foreground_probe(|| false))
    }

    #[test]
    fn detached_adapter_refuses_to_arm() {
        let timer = Arc::new(ManualTimer::new());
        let adapter = adapter_on(&timer);
        let payload = Notification {
            message: None,
            title: None,
            icon: None,
            sound_path: None,
            silent: false,
            vibrate: true,
            data: Default::default(),
            fire_at: Utc::now(),
        };
        assert!(matches!(
            adapter.arm(1, Utc::now(), payload),
            Err(AdapterError::Detached)
        ));
    }

    #[test]
    fn fires_through_the_registry() {
        let timer = Arc::new(ManualTimer::new());
        let adapter = adapter_on(&timer);
        let notifications = NotificationsBuilder::new()
            .with_adapter(adapter.clone())
            .build()
            .unwrap();

        let handle = notifications
            .builder()
            .message("tea is ready")
            .schedule(Utc::now().timestamp_millis() + 200)
            .unwrap();
        assert_eq!(adapter.armed_ids(), vec![handle.id()]);

        timer.advance(Duration::from_millis(250));
        assert!(adapter.armed_ids().is_empty());
        assert!(notifications.pending_ids().is_empty());
        let arrived = notifications.incoming().drain();
        assert_eq!(arrived.len(), 1);
        assert!(!arrived[0].was_active);
    }

    #[test]
    fn cancel_by_id_stops_the_interval() {
        let timer = Arc::new(ManualTimer::new());
        let adapter = adapter_on(&timer);
        let _notifications = NotificationsBuilder::new()
            .with_adapter(adapter.clone())
            .build()
            .unwrap();
        let payload = Notification {
            message: Some("later".into()),
            title: None,
            icon: None,
            sound_path: None,
            silent: true,
            vibrate: false,
            data: Default::default(),
            fire_at: Utc::now(),
        };
        adapter
            .arm(7, Utc::now() + chrono::Duration::seconds(1), payload)
            .unwrap();

        assert!(adapter.cancel_id(7));
        assert!(!adapter.cancel_id(7));
        assert_eq!(timer.live_tasks(), 0);
    }
}
