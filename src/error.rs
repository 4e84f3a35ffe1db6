//! Error types for recache.
//!
//! All errors are strongly typed using thiserror. `StreamError` is the value
//! carried through streams; the remaining types cover configuration and the
//! cross-thread inbox.

use thiserror::Error;

/// Terminal error notification carried by a stream.
///
/// Combinators forward these verbatim, so every subscriber of a shared run
/// observes an equal value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("Producer failed: {message}")]
    Producer {
        message: String,
    },

    #[error("Trigger failed: {message}")]
    Trigger {
        message: String,
    },
}

impl StreamError {
    /// Creates an error raised by a wrapped producer.
    #[must_use]
    pub fn producer(message: impl Into<String>) -> Self {
        Self::Producer {
            message: message.into(),
        }
    }

    /// Creates an error raised by a refresher or notifier stream.
    #[must_use]
    pub fn trigger(message: impl Into<String>) -> Self {
        Self::Trigger {
            message: message.into(),
        }
    }

    /// Returns true if the error came from a producer.
    #[must_use]
    pub const fn is_producer(&self) -> bool {
        matches!(self, Self::Producer { .. })
    }

    /// Returns true if the error came from a trigger stream.
    #[must_use]
    pub const fn is_trigger(&self) -> bool {
        matches!(self, Self::Trigger { .. })
    }

    /// The human readable message.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Producer { message } | Self::Trigger { message } => message,
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to parse cache config: {message}")]
    Parse {
        message: String,
    },
}

/// Errors sending notifications into a scheduler from another thread.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("Scheduler inbox is full (capacity {capacity})")]
    Full {
        capacity: usize,
    },

    #[error("Scheduler inbox is disconnected")]
    Disconnected,
}

/// Top-level error type for recache.
#[derive(Debug, Error)]
pub enum RecacheError {
    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl RecacheError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a stream error.
    #[must_use]
    pub const fn is_stream(&self) -> bool {
        matches!(self, Self::Stream(_))
    }

    /// Returns true if this is a configuration error.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Returns true if this is a remote inbox error.
    #[must_use]
    pub const fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }

    /// Returns true if retrying the same call may succeed.
    ///
    /// Stream errors are terminal; a full inbox drains once the scheduler runs.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Remote(RemoteError::Full { .. }))
    }
}

/// Result type alias for recache operations.
pub type RecacheResult<T> = Result<T, RecacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_error_producer() {
        let err = StreamError::producer("db down");
        assert!(err.is_producer());
        assert!(!err.is_trigger());
        assert_eq!(err.message(), "db down");
        assert!(format!("{err}").contains("Producer failed"));
    }

    #[test]
    fn test_stream_error_trigger() {
        let err = StreamError::trigger("webhook closed");
        assert!(err.is_trigger());
        assert!(format!("{err}").contains("webhook closed"));
    }

    #[test]
    fn test_stream_errors_compare_by_value() {
        assert_eq!(StreamError::producer("x"), StreamError::producer("x"));
        assert_ne!(StreamError::producer("x"), StreamError::trigger("x"));
    }

    #[test]
    fn test_remote_error_full() {
        let err = RemoteError::Full { capacity: 8 };
        let msg = format!("{err}");
        assert!(msg.contains("full"));
        assert!(msg.contains('8'));
    }

    #[test]
    fn test_recache_error_from_stream() {
        let err: RecacheError = StreamError::producer("boom").into();
        assert!(err.is_stream());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_recache_error_from_config() {
        let err: RecacheError = ConfigError::Parse {
            message: "missing field".to_string(),
        }
        .into();
        assert!(err.is_config());
        assert!(format!("{err}").contains("missing field"));
    }

    #[test]
    fn test_recache_error_retryable() {
        let full: RecacheError = RemoteError::Full { capacity: 1 }.into();
        assert!(full.is_remote());
        assert!(full.is_retryable());

        let gone: RecacheError = RemoteError::Disconnected.into();
        assert!(!gone.is_retryable());

        let internal = RecacheError::internal("unexpected state");
        assert!(!internal.is_retryable());
        assert!(format!("{internal}").contains("unexpected state"));
    }
}
