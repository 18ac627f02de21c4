use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::time::Duration;

use anyhow::{Context, Result};
use chime_core::{Clock, WorkerThread};
use chime_notify::{
    FileStore, Incoming, IntervalAdapter, KeyValueStore, MemoryStore, NotificationsBuilder,
    DEFAULT_STORAGE_KEY,
};
use chrono::Utc;
use tracing::{debug, info, warn};

const DEFAULT_DELAY_MS: u64 = 1_000;
const DEFAULT_GRACE_MS: u64 = 5_000;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub(crate) store: Option<PathBuf>,
    pub(crate) pending_key: String,
    pub(crate) delay: Duration,
    pub(crate) message: String,
    pub(crate) id: Option<String>,
    pub(crate) wait: Option<Duration>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(path) = std::env::var("CHIME_STORE") {
            if !path.trim().is_empty() {
                config.store = Some(PathBuf::from(path));
            }
        }
        if let Ok(key) = std::env::var("CHIME_PENDING_KEY") {
            if !key.trim().is_empty() {
                config.pending_key = key;
            }
        }
        if let Ok(delay) = std::env::var("CHIME_DELAY_MS") {
            if let Ok(value) = delay.trim().parse::<u64>() {
                config.delay = Duration::from_millis(value);
            }
        }
        if let Ok(message) = std::env::var("CHIME_MESSAGE") {
            config.message = message;
        }
        if let Ok(id) = std::env::var("CHIME_ID") {
            if !id.is_empty() {
                config.id = Some(id);
            }
        }
        if let Ok(wait) = std::env::var("CHIME_WAIT_MS") {
            if let Ok(value) = wait.trim().parse::<u64>() {
                config.wait = Some(Duration::from_millis(value));
            }
        }
        Ok(config)
    }

    pub fn wait(&self) -> Duration {
        self.wait
            .unwrap_or_else(|| self.delay + Duration::from_millis(DEFAULT_GRACE_MS))
    }

    fn open_store(&self) -> Result<Arc<dyn KeyValueStore>> {
        match &self.store {
            Some(path) => {
                info!(path = %path.display(), "using file store");
                let store = FileStore::open(path)
                    .with_context(|| format!("failed to open store at {}", path.display()))?;
                Ok(Arc::new(store))
            }
            None => {
                debug!("using in-memory store");
                Ok(Arc::new(MemoryStore::new()))
            }
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            store: None,
            pending_key: DEFAULT_STORAGE_KEY.to_string(),
            delay: Duration::from_millis(DEFAULT_DELAY_MS),
            message: "Time is up".to_string(),
            id: None,
            wait: None,
        }
    }
}

/// Schedules one notification and reports it when it arrives. Returns what arrived.
pub fn run(config: AppConfig) -> Result<Vec<Incoming>> {
    let worker = Arc::new(WorkerThread::spawn("chime-dispatch").context("failed to start dispatcher")?);
    let clock = Clock::threaded(worker.clone());
    let adapter = Arc::new(IntervalAdapter::new(clock));
    let notifications = NotificationsBuilder::new()
        .with_store(config.open_store()?)
        .with_adapter(adapter)
        .with_storage_key(config.pending_key.clone())
        .build()
        .context("failed to build notifications registry")?;

    let restored = notifications.pending_ids();
    if !restored.is_empty() {
        warn!(ids = ?restored, "pending notifications from an earlier run cannot fire here");
    }

    let (tx, rx) = mpsc::channel();
    let listener = notifications.incoming().subscribe(move |incoming| {
        let _ = tx.send(incoming.clone());
    });

    let fire_at = Utc::now()
        + chrono::Duration::from_std(config.delay).context("notification delay out of range")?;
    let mut builder = notifications.builder().message(config.message.clone());
    if let Some(id) = &config.id {
        builder = builder.id(id.clone());
    }
    let handle = builder
        .schedule_at(fire_at)
        .context("failed to schedule notification")?;
    info!(id = handle.id(), %fire_at, "notification scheduled");

    match rx.recv_timeout(config.wait()) {
        Ok(incoming) => {
            info!(id = ?incoming.id(), was_active = incoming.was_active, "notification arrived")
        }
        Err(_) => {
            warn!(id = handle.id(), "notification did not arrive in time, cancelling");
            handle.cancel();
        }
    }

    notifications.incoming().unsubscribe(listener);
    let arrived = notifications.incoming().drain();
    worker.shutdown();
    Ok(arrived)
}
