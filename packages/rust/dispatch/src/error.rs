//! Completion failure taxonomy.

use std::time::Duration;

/// Failure classes the retry policy decides on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    TransientNetwork,
    RateLimited,
    Upstream5xx,
    Timeout,
    Authentication,
    Validation,
    QuotaExhausted,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        match self {
            Self::TransientNetwork | Self::RateLimited | Self::Upstream5xx | Self::Timeout => true,
            Self::Authentication | Self::Validation | Self::QuotaExhausted => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::TransientNetwork => "transient_network",
            Self::RateLimited => "rate_limited",
            Self::Upstream5xx => "upstream_5xx",
            Self::Timeout => "timeout",
            Self::Authentication => "authentication",
            Self::Validation => "validation",
            Self::QuotaExhausted => "quota_exhausted",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Anything the retry policy can judge.
pub trait Classify {
    fn class(&self) -> ErrorClass;

    /// Server-provided wait hint, when the failure carried one.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// A failed completion call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{class}: {message}")]
pub struct CompletionError {
    pub class: ErrorClass,
    pub message: String,
    pub retry_after: Option<Duration>,
}

impl CompletionError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            class: ErrorClass::RateLimited,
            message: message.into(),
            retry_after,
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            ErrorClass::Timeout,
            format!("no response within {}ms", after.as_millis()),
        )
    }
}

impl Classify for CompletionError {
    fn class(&self) -> ErrorClass {
        self.class
    }

    fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }
}

/// Why a submitted call produced no response.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CallError {
    /// Fatal failure, or retries exhausted. `attempts` counts calls made.
    #[error("call failed after {attempts} attempt(s): {error}")]
    Failed {
        error: CompletionError,
        attempts: u32,
    },

    #[error("call cancelled before dispatch")]
    Cancelled,

    #[error("call controller shut down")]
    Shutdown,
}

impl CallError {
    /// Class of the underlying failure, if the call was attempted at all.
    pub fn class(&self) -> Option<ErrorClass> {
        match self {
            Self::Failed { error, .. } => Some(error.class),
            Self::Cancelled | Self::Shutdown => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_split() {
        let retryable = [
            ErrorClass::TransientNetwork,
            ErrorClass::RateLimited,
            ErrorClass::Upstream5xx,
            ErrorClass::Timeout,
        ];
        let fatal = [
            ErrorClass::Authentication,
            ErrorClass::Validation,
            ErrorClass::QuotaExhausted,
        ];
        assert!(retryable.iter().all(|c| c.is_retryable()));
        assert!(fatal.iter().all(|c| !c.is_retryable()));
    }

    #[test]
    fn display_includes_class() {
        let err = CompletionError::rate_limited("slow down", Some(Duration::from_secs(2)));
        assert_eq!(err.to_string(), "rate_limited: slow down");
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
    }
}
