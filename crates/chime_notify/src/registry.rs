use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::adapter::{AdapterHandle, Delivery, DeliveryAdapter, Notification};
use crate::builder::{derive_id, NotificationBuilder};
use crate::error::NotifyError;
use crate::incoming::{Incoming, IncomingLog};
use crate::pending::{PendingRegistry, DEFAULT_STORAGE_KEY};
use crate::storage::{KeyValueStore, MemoryStore};

/// Schedules notifications through a platform adapter and guarantees at most one delivery per
/// pending id.
#[derive(Clone)]
pub struct Notifications {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    adapter: Arc<dyn DeliveryAdapter>,
    state: Mutex<RegistryState>,
    incoming: IncomingLog,
}

struct RegistryState {
    pending: PendingRegistry,
    scheduled: HashMap<i32, Scheduled>,
    next_ticket: u64,
}

// Ids are reused once settled; the ticket tells one scheduling of an id from the next.
struct Scheduled {
    ticket: u64,
    handle: Option<Box<dyn AdapterHandle>>,
}

pub struct NotificationsBuilder {
    store: Option<Arc<dyn KeyValueStore>>,
    adapter: Option<Arc<dyn DeliveryAdapter>>,
    storage_key: String,
}

impl NotificationsBuilder {
    pub fn new() -> Self {
        Self {
            store: None,
            adapter: None,
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn DeliveryAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    pub fn with_storage_key(mut self, key: impl Into<String>) -> Self {
        self.storage_key = key.into();
        self
    }

    pub fn build(self) -> Result<Notifications, NotifyError> {
        let adapter = self.adapter.ok_or(NotifyError::MissingAdapter)?;
        let store: Arc<dyn KeyValueStore> = match self.store {
            Some(store) => store,
            None => Arc::new(MemoryStore::new()),
        };
        let pending = PendingRegistry::load(store, self.storage_key)?;
        if !pending.is_empty() {
            info!(count = pending.len(), "restored pending notifications");
        }
        let inner = Arc::new(RegistryInner {
            adapter: Arc::clone(&adapter),
            state: Mutex::new(RegistryState {
                pending,
                scheduled: HashMap::new(),
                next_ticket: 0,
            }),
            incoming: IncomingLog::new(),
        });
        adapter.attach(DeliverySink {
            registry: Arc::downgrade(&inner),
        });
        Ok(Notifications { inner })
    }
}

impl Default for NotificationsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifications {
    pub fn builder(&self) -> NotificationBuilder {
        NotificationBuilder::new(self.clone())
    }

    #[instrument(skip(self, notification), fields(key = ?notification.key(), fire_at = %notification.fire_at))]
    pub fn schedule(&self, notification: Notification) -> Result<Handle, NotifyError> {
        let (id, ticket) = self.inner.schedule(notification)?;
        Ok(Handle {
            id,
            ticket,
            registry: Arc::downgrade(&self.inner),
        })
    }

    #[instrument(skip(self))]
    pub fn cancel_all(&self) {
        self.inner.cancel_all();
    }

    /// Platform callback for a fired timer. The id is removed atomically; only a pending id is
    /// surfaced, so a firing that lost a race with cancellation is ignored.
    pub fn deliver(&self, id: i32, payload: Notification, was_active: bool) -> Delivery {
        self.inner.deliver(id, payload, was_active)
    }

    pub fn incoming(&self) -> &IncomingLog {
        &self.inner.incoming
    }

    pub fn pending_ids(&self) -> Vec<i32> {
        self.inner.state.lock().pending.ids()
    }

    pub fn is_pending(&self, id: i32) -> bool {
        self.inner.state.lock().pending.contains(id)
    }

    pub fn sink(&self) -> DeliverySink {
        DeliverySink {
            registry: Arc::downgrade(&self.inner),
        }
    }
}

impl fmt::Debug for Notifications {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifications")
            .field("pending", &self.pending_ids())
            .field("incoming", &self.inner.incoming.len())
            .finish()
    }
}

impl RegistryInner {
    fn schedule(&self, notification: Notification) -> Result<(i32, u64), NotifyError> {
        let (id, ticket) = {
            let mut state = self.state.lock();
            let id = match notification.key() {
                Some(key) => derive_id(key),
                None => state.pending.next_automatic_id()?,
            };
            state.pending.insert(id)?;
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            // Retire the replaced timer while the id is still locked so it cannot deliver in
            // between.
            let replaced = state.scheduled.insert(id, Scheduled { ticket, handle: None });
            if let Some(handle) = replaced.and_then(|previous| previous.handle) {
                debug!(id, "replacing armed notification");
                handle.cancel();
            }
            (id, ticket)
        };

        let fire_at = notification.fire_at;
        let handle = match self.adapter.arm(id, fire_at, notification) {
            Ok(handle) => handle,
            Err(err) => {
                warn!(id, %err, "failed to arm notification");
                let mut state = self.state.lock();
                if state.is_current(id, ticket) {
                    state.scheduled.remove(&id);
                    state.pending.remove(id);
                }
                return Err(err.into());
            }
        };

        let mut state = self.state.lock();
        if state.is_current(id, ticket) {
            if let Some(entry) = state.scheduled.get_mut(&id) {
                entry.handle = Some(handle);
            }
            debug!(id, %fire_at, "notification armed");
        } else {
            drop(state);
            debug!(id, "notification settled while arming");
            handle.cancel();
        }
        Ok((id, ticket))
    }

    fn cancel(&self, id: i32, ticket: u64) {
        let scheduled = {
            let mut state = self.state.lock();
            if !state.is_current(id, ticket) {
                debug!(id, "notification already delivered, cancelled or replaced");
                return;
            }
            state.pending.remove(id);
            state.scheduled.remove(&id)
        };
        let found = match scheduled.and_then(|entry| entry.handle) {
            Some(handle) => handle.cancel(),
            None => self.adapter.cancel_id(id),
        };
        if found {
            info!(id, "notification cancelled");
        } else {
            warn!(id, "failed to cancel notification timer");
        }
    }

    fn cancel_all(&self) {
        let (ids, mut scheduled) = {
            let mut state = self.state.lock();
            let ids = state.pending.clear();
            (ids, std::mem::take(&mut state.scheduled))
        };
        for id in &ids {
            let found = match scheduled.remove(id).and_then(|entry| entry.handle) {
                Some(handle) => handle.cancel(),
                None => self.adapter.cancel_id(*id),
            };
            if !found {
                warn!(id, "failed to cancel notification");
            }
        }
        info!(count = ids.len(), "cancelled all notifications");
    }

    fn deliver(&self, id: i32, payload: Notification, was_active: bool) -> Delivery {
        let (removed, scheduled) = {
            let mut state = self.state.lock();
            let removed = state.pending.remove(id);
            (removed, state.scheduled.remove(&id))
        };
        drop(scheduled);
        if !removed {
            warn!(id, "ignoring notification request due to non-existing id");
            return Delivery::Ignored;
        }
        info!(id, text = ?payload.message, was_active, "notification delivered");
        self.incoming.push(Incoming::new(payload.data, was_active));
        Delivery::Delivered
    }
}

impl RegistryState {
    fn is_current(&self, id: i32, ticket: u64) -> bool {
        self.scheduled
            .get(&id)
            .is_some_and(|entry| entry.ticket == ticket)
    }
}

#[derive(Clone)]
pub struct Handle {
    id: i32,
    ticket: u64,
    registry: Weak<RegistryInner>,
}

impl Handle {
    pub fn id(&self) -> i32 {
        self.id
    }

    /// No-op once this notification has been delivered, cancelled or replaced, even if its id
    /// now belongs to a newer one.
    pub fn cancel(&self) {
        if let Some(inner) = self.registry.upgrade() {
            inner.cancel(self.id, self.ticket);
        }
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle").field("id", &self.id).finish()
    }
}

#[derive(Clone)]
pub struct DeliverySink {
    registry: Weak<RegistryInner>,
}

impl DeliverySink {
    pub fn on_fire(&self, id: i32, payload: Notification, app_was_foregrounded: bool) -> Delivery {
        match self.registry.upgrade() {
            Some(inner) => inner.deliver(id, payload, app_was_foregrounded),
            None => {
                warn!(id, "notification fired after registry was dropped");
                Delivery::Ignored
            }
        }
    }
}

impl fmt::Debug for DeliverySink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliverySink")
            .field("attached", &(self.registry.strong_count() > 0))
            .finish()
    }
}
