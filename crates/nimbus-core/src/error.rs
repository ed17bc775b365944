use std::sync::Arc;
use std::time::Duration;

/// Errors surfaced to request queue callers.
///
/// `Clone` because one outcome may be delivered to many deduplicated
/// waiters; upstream failures ride behind an `Arc` for the same reason.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("request queue is not running; call start() first")]
    NotRunning,

    #[error("start() must be called from within a tokio runtime")]
    NoRuntime,

    #[error("failed to serialize request parameters: {0}")]
    KeySerialization(String),

    /// The wrapped callable failed. The original error is preserved verbatim
    /// and can be inspected or downcast through the `Arc`.
    #[error("upstream request failed: {0}")]
    Upstream(Arc<anyhow::Error>),

    /// Cross-thread submission gave up waiting. The underlying request keeps
    /// running for any other waiters.
    #[error("timed out after {0:?} waiting for the request result")]
    WaitTimeout(Duration),

    #[error("request queue shut down before the request resolved")]
    ShutDown,

    /// The result of a deduplicated request could not be downcast to the
    /// type this caller asked for — two call sites registered the same key
    /// with different result types.
    #[error("request resolved to a type other than {0}")]
    TypeMismatch(&'static str),
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::KeySerialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;
