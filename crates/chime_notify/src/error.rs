use chime_core::IntervalError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("delivery adapter is not attached to a registry")]
    Detached,
    #[error("platform rejected notification {id}: {reason}")]
    Rejected { id: i32, reason: String },
    #[error(transparent)]
    Interval(#[from] IntervalError),
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("no automatic notification id available")]
    IdSpaceExhausted,
    #[error("fire time {0}ms is outside the representable range")]
    InvalidFireTime(i64),
    #[error("notifications registry needs a delivery adapter")]
    MissingAdapter,
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
}
