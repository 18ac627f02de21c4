use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};

use crate::adapter::Notification;
use crate::error::NotifyError;
use crate::registry::{Handle, Notifications};

pub const ID_KEY: &str = "notifier_id";

/// Stable non-negative id for a caller-supplied id string: the 31-multiplier string hash over
/// UTF-16 code units, with the sign bit cleared.
pub fn derive_id(key: &str) -> i32 {
    let hash = key.encode_utf16().fold(0i32, |hash, unit| {
        hash.wrapping_mul(31).wrapping_add(i32::from(unit))
    });
    hash & i32::MAX
}

#[must_use]
pub struct NotificationBuilder {
    registry: Notifications,
    message: Option<String>,
    title: Option<String>,
    icon: Option<u32>,
    sound_path: Option<String>,
    silent: bool,
    vibrate: bool,
    data: BTreeMap<String, String>,
}

impl NotificationBuilder {
    pub(crate) fn new(registry: Notifications) -> Self {
        Self {
            registry,
            message: None,
            title: None,
            icon: None,
            sound_path: None,
            silent: false,
            vibrate: true,
            data: BTreeMap::new(),
        }
    }

    /// Stored under [`ID_KEY`] in the data map; scheduling the same id again replaces the
    /// earlier notification.
    pub fn id(self, id: impl Into<String>) -> Self {
        self.data(ID_KEY, id)
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn icon(mut self, resource: u32) -> Self {
        self.icon = Some(resource);
        self
    }

    pub fn sound_path(mut self, path: impl Into<String>) -> Self {
        self.sound_path = Some(path.into());
        self
    }

    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    pub fn vibrate(mut self, vibrate: bool) -> Self {
        self.vibrate = vibrate;
        self
    }

    pub fn data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn schedule(self, epoch_millis: i64) -> Result<Handle, NotifyError> {
        let fire_at = DateTime::<Utc>::from_timestamp_millis(epoch_millis)
            .ok_or(NotifyError::InvalidFireTime(epoch_millis))?;
        self.schedule_at(fire_at)
    }

    pub fn schedule_at(self, fire_at: DateTime<Utc>) -> Result<Handle, NotifyError> {
        let NotificationBuilder {
            registry,
            message,
            title,
            icon,
            sound_path,
            silent,
            vibrate,
            data,
        } = self;
        registry.schedule(Notification {
            message,
            title,
            icon,
            sound_path,
            silent,
            vibrate,
            data,
            fire_at,
        })
    }
}

impl fmt::Debug for NotificationBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationBuilder")
            .field("message", &self.message)
            .field("sound_path", &self.sound_path)
            .field("silent", &self.silent)
            .field("data", &self.data)
            .finish()
    }
}
