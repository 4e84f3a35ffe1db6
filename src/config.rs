//! Cache configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Settings for [`crate::cache()`].
///
/// The refresher stream is not part of the serialised form; attach it with
/// [`crate::Cache::refresher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// How long values stay servable, and how long after a run completes the
    /// cache waits before it may run the producer again.
    #[serde(rename = "expiration_time_ms", with = "millis")]
    pub expiration_time: Duration,

    /// Run the producer again as soon as the cache expires instead of waiting
    /// for the next subscriber.
    #[serde(default)]
    pub automatic_refresh: bool,

    /// Most recent values replayed to late subscribers.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

fn default_buffer_size() -> usize {
    1
}

impl CacheConfig {
    #[must_use]
    pub const fn new(expiration_time: Duration) -> Self {
        Self {
            expiration_time,
            automatic_refresh: false,
            buffer_size: 1,
        }
    }

    #[must_use]
    pub const fn with_automatic_refresh(mut self, automatic_refresh: bool) -> Self {
        self.automatic_refresh = automatic_refresh;
        self
    }

    #[must_use]
    pub const fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Buffer size in use; zero falls back to one.
    #[must_use]
    pub const fn effective_buffer_size(&self) -> usize {
        if self.buffer_size == 0 {
            1
        } else {
            self.buffer_size
        }
    }

    /// The replay window, always equal to the expiration time.
    #[must_use]
    pub const fn window_time(&self) -> Duration {
        self.expiration_time
    }

    /// Parses a JSON object such as `{"expiration_time_ms": 10000}`.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|err| ConfigError::Parse {
            message: err.to_string(),
        })
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
