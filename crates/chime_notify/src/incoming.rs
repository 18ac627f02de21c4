use std::collections::{BTreeMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::builder::ID_KEY;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incoming {
    pub data: BTreeMap<String, String>,
    pub was_active: bool,
}

impl Incoming {
    pub fn new(data: BTreeMap<String, String>, was_active: bool) -> Self {
        Self { data, was_active }
    }

    pub fn id(&self) -> Option<&str> {
        self.data.get(ID_KEY).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&Incoming) + Send + Sync>;

/// Arrived notifications in arrival order. Entries stay until the application drains them.
#[derive(Default)]
pub struct IncomingLog {
    entries: Mutex<VecDeque<Incoming>>,
    listeners: RwLock<Vec<(ListenerId, Listener)>>,
    next_listener: AtomicU64,
}

impl IncomingLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: impl Fn(&Incoming) + Send + Sync + 'static) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(candidate, _)| *candidate != id);
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<Incoming> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn pop(&self) -> Option<Incoming> {
        self.entries.lock().pop_front()
    }

    pub fn drain(&self) -> Vec<Incoming> {
        self.entries.lock().drain(..).collect()
    }

    pub(crate) fn push(&self, incoming: Incoming) {
        self.entries.lock().push_back(incoming.clone());
        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            if panic::catch_unwind(AssertUnwindSafe(|| listener(&incoming))).is_err() {
                error!(id = ?incoming.id(), "incoming notification listener panicked");
            }
        }
    }
}
