use std::time::Duration;

use feedforge_shared::FeedforgeError;

/// Outcome classes for producers and job handlers.
///
/// Handlers return `Retryable` or `Fatal` to steer what the channel does with
/// the job; producers get `Validation` for malformed jobs.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Malformed job rejected at send time. Never enqueued.
    #[error("invalid job: {message}")]
    Validation { message: String },

    /// The job may succeed later. `delay` postpones the next delivery.
    #[error("retryable failure: {message}")]
    Retryable {
        message: String,
        delay: Option<Duration>,
    },

    /// The job can never succeed; it goes straight to dead letters.
    #[error("fatal failure: {message}")]
    Fatal { message: String },

    /// The queue backend itself failed.
    #[error("queue transport error: {0}")]
    Transport(String),
}

impl QueueError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable {
            message: msg.into(),
            delay: None,
        }
    }

    pub fn retry_after(msg: impl Into<String>, delay: Duration) -> Self {
        Self::Retryable {
            message: msg.into(),
            delay: Some(delay),
        }
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal {
            message: msg.into(),
        }
    }

    /// Whether a handler failure of this kind earns another delivery.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. } | Self::Transport(_))
    }
}

impl From<FeedforgeError> for QueueError {
    fn from(err: FeedforgeError) -> Self {
        match err {
            FeedforgeError::Validation { message } => Self::Validation { message },
            other => Self::Transport(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classes() {
        assert!(QueueError::retryable("x").is_retryable());
        assert!(QueueError::Transport("down".into()).is_retryable());
        assert!(!QueueError::fatal("x").is_retryable());
        assert!(!QueueError::validation("x").is_retryable());
    }

    #[test]
    fn storage_errors_become_transport() {
        let err: QueueError = FeedforgeError::Storage("locked".into()).into();
        assert!(matches!(err, QueueError::Transport(_)));
        let err: QueueError = FeedforgeError::validation("bad").into();
        assert!(matches!(err, QueueError::Validation { .. }));
    }
}
