pub mod adapter;
pub mod builder;
pub mod error;
pub mod incoming;
pub mod local;
pub mod pending;
pub mod registry;
pub mod storage;

pub use crate::adapter::{AdapterHandle, Delivery, DeliveryAdapter, Notification};
pub use crate::builder::{derive_id, NotificationBuilder, ID_KEY};
pub use crate::error::{AdapterError, NotifyError, StorageError};
pub use crate::incoming::{Incoming, IncomingLog, ListenerId};
pub use crate::local::IntervalAdapter;
pub use crate::pending::{PendingRegistry, DEFAULT_STORAGE_KEY};
pub use crate::registry::{DeliverySink, Handle, Notifications, NotificationsBuilder};
pub use crate::storage::{FileStore, KeyValueStore, MemoryStore};
