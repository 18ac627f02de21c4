use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntervalError {
    /// Fixed-delay repeats cannot be honoured once the expiration is queued on another context.
    #[error("fixed-delay repeats require an inline dispatcher")]
    FixedDelayRequiresInline,
    #[error("timer source unavailable after recreation")]
    TimerUnavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimerError {
    #[error("timer thread is no longer running")]
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PostError {
    #[error("dispatcher `{0}` has been shut down")]
    Closed(String),
}
