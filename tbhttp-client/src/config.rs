use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::util::http::Uri;
use crate::util::json::{deserialize_duration_from_ms, serialize_duration_to_ms};
use crate::util::types::AccessToken;

/// Timeout applied to every request unless overridden per call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

/// Device client configuration
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Root URI of the ThingsBoard instance
    pub host: Uri,

    /// Device access token
    pub token: AccessToken,

    /// Display name of the device, only used for logging
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Request timeout. Also used as the long-poll timeout for subscriptions.
    #[serde(
        default = "default_timeout",
        deserialize_with = "deserialize_duration_from_ms",
        serialize_with = "serialize_duration_to_ms"
    )]
    pub timeout: Duration,

    #[serde(default)]
    pub publish: PublishConfig,
}

impl ClientConfig {
    pub fn new(host: Uri, token: impl Into<AccessToken>) -> Self {
        Self {
            host,
            token: token.into(),
            name: None,
            timeout: DEFAULT_TIMEOUT,
            publish: PublishConfig::default(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_publish(mut self, publish: PublishConfig) -> Self {
        self.publish = publish;
        self
    }
}

/// Publish queue behavior.
///
/// The defaults retry a failed task forever with a fixed one second pause.
/// Raising `retry_max_backoff` above `retry_min_backoff` turns the pause
/// into an exponential backoff, and `max_attempts` moves tasks that keep
/// failing to the dead-letter handler.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct PublishConfig {
    /// How long the worker waits on an empty queue before checking for a stop request
    #[serde(
        deserialize_with = "deserialize_duration_from_ms",
        serialize_with = "serialize_duration_to_ms"
    )]
    pub poll_interval: Duration,

    #[serde(
        deserialize_with = "deserialize_duration_from_ms",
        serialize_with = "serialize_duration_to_ms"
    )]
    pub retry_min_backoff: Duration,

    #[serde(
        deserialize_with = "deserialize_duration_from_ms",
        serialize_with = "serialize_duration_to_ms"
    )]
    pub retry_max_backoff: Duration,

    #[serde(
        deserialize_with = "deserialize_duration_from_ms",
        serialize_with = "serialize_duration_to_ms"
    )]
    pub retry_max_jitter: Duration,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1_000),
            retry_min_backoff: Duration::from_millis(1_000),
            retry_max_backoff: Duration::from_millis(1_000),
            retry_max_jitter: Duration::ZERO,
            max_attempts: None,
        }
    }
}
