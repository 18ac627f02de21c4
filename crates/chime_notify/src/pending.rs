use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{NotifyError, StorageError};
use crate::storage::KeyValueStore;

pub const DEFAULT_STORAGE_KEY: &str = "chime.notifications";

#[derive(Debug, Serialize, Deserialize)]
struct StoredIds {
    ids: Vec<i32>,
}

/// Ids armed with the platform but not yet delivered or cancelled, mirrored to storage on every
/// change.
pub struct PendingRegistry {
    store: Arc<dyn KeyValueStore>,
    key: String,
    ids: HashSet<i32>,
}

impl PendingRegistry {
    pub fn load(store: Arc<dyn KeyValueStore>, key: impl Into<String>) -> Result<Self, StorageError> {
        let key = key.into();
        let ids = match store.get_item(&key)? {
            None => HashSet::new(),
            Some(raw) => match serde_json::from_str::<StoredIds>(&raw) {
                Ok(stored) => stored.ids.into_iter().collect(),
                Err(err) => {
                    warn!(%key, %err, %raw, "failed to parse pending notification ids");
                    if let Err(err) = store.remove_item(&key) {
                        warn!(%key, %err, "unable to discard malformed pending ids");
                    }
                    HashSet::new()
                }
            },
        };
        Ok(Self { store, key, ids })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn contains(&self, id: i32) -> bool {
        self.ids.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> Vec<i32> {
        let mut ids: Vec<i32> = self.ids.iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn insert(&mut self, id: i32) -> Result<bool, StorageError> {
        if self.ids.contains(&id) {
            return Ok(false);
        }
        let mut next = self.ids.clone();
        next.insert(id);
        self.persist(&next)?;
        self.ids = next;
        Ok(true)
    }

    /// Test-and-remove. A failed write leaves an orphaned stored id, which never fires.
    pub fn remove(&mut self, id: i32) -> bool {
        if !self.ids.remove(&id) {
            return false;
        }
        if let Err(err) = self.persist(&self.ids) {
            warn!(id, %err, "pending id removed but not persisted");
        }
        true
    }

    pub fn clear(&mut self) -> Vec<i32> {
        let cleared = self.ids();
        self.ids.clear();
        if let Err(err) = self.persist(&self.ids) {
            warn!(%err, "pending ids cleared but not persisted");
            if let Err(err) = self.store.remove_item(&self.key) {
                warn!(%err, "unable to discard stored pending ids");
            }
        }
        cleared
    }

    /// First free id counting down from -1. Negative ids never collide with ids derived from
    /// caller-supplied names.
    pub fn next_automatic_id(&self) -> Result<i32, NotifyError> {
        ((i32::MIN + 1)..0)
            .rev()
            .find(|id| !self.ids.contains(id))
            .ok_or(NotifyError::IdSpaceExhausted)
    }

    fn persist(&self, ids: &HashSet<i32>) -> Result<(), StorageError> {
        let mut sorted: Vec<i32> = ids.iter().copied().collect();
        sorted.sort_unstable();
        let raw = serde_json::to_string(&StoredIds { ids: sorted })?;
        self.store.set_item(&self.key, &raw)
    }
}
