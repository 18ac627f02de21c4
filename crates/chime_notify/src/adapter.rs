use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::builder::ID_KEY;
use crate::error::AdapterError;
use crate::registry::DeliverySink;

/// Frozen parameters of one scheduled notification, carried opaquely to the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub message: Option<String>,
    pub title: Option<String>,
    pub icon: Option<u32>,
    pub sound_path: Option<String>,
    pub silent: bool,
    pub vibrate: bool,
    pub data: BTreeMap<String, String>,
    pub fire_at: DateTime<Utc>,
}

impl Notification {
    pub fn key(&self) -> Option<&str> {
        self.data.get(ID_KEY).map(String::as_str)
    }
}

/// Outcome of a platform firing handed back to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    Ignored,
}

impl Delivery {
    pub fn is_delivered(self) -> bool {
        matches!(self, Delivery::Delivered)
    }
}

pub trait AdapterHandle: Send + Sync {
    fn cancel(&self) -> bool;
}

/// Platform-specific notification adapters will implement this trait.
pub trait DeliveryAdapter: Send + Sync {
    fn attach(&self, sink: DeliverySink) {
        let _ = sink;
    }

    fn arm(
        &self,
        id: i32,
        fire_at: DateTime<Utc>,
        payload: Notification,
    ) -> Result<Box<dyn AdapterHandle>, AdapterError>;

    /// Cancels by id, for ids restored from storage that have no handle in this process.
    fn cancel_id(&self, id: i32) -> bool;
}
