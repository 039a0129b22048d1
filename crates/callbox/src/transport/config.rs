use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::backoff::Backoff;

const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 1_000;
const DEFAULT_RECONNECT_DECAY: f64 = 1.5;
const DEFAULT_MAX_RECONNECT_INTERVAL_MS: u64 = 30_000;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub reconnect_interval_ms: u64,
    pub reconnect_decay: f64,
    pub max_reconnect_interval_ms: u64,
    /// `None` retries forever.
    pub max_reconnect_attempts: Option<u32>,
    pub connect_timeout_ms: u64,
    /// Debug-log every frame handed to the socket.
    pub log_frames: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            reconnect_interval_ms: DEFAULT_RECONNECT_INTERVAL_MS,
            reconnect_decay: DEFAULT_RECONNECT_DECAY,
            max_reconnect_interval_ms: DEFAULT_MAX_RECONNECT_INTERVAL_MS,
            max_reconnect_attempts: None,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            log_frames: false,
        }
    }
}

impl TransportConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            reconnect_interval_ms: env_parse("CALLBOX_RECONNECT_INTERVAL_MS")
                .unwrap_or(defaults.reconnect_interval_ms),
            reconnect_decay: env_parse("CALLBOX_RECONNECT_DECAY")
                .unwrap_or(defaults.reconnect_decay),
            max_reconnect_interval_ms: env_parse("CALLBOX_MAX_RECONNECT_INTERVAL_MS")
                .unwrap_or(defaults.max_reconnect_interval_ms),
            max_reconnect_attempts: env_parse("CALLBOX_MAX_RECONNECT_ATTEMPTS")
                .filter(|attempts: &u32| *attempts > 0),
            connect_timeout_ms: env_parse("CALLBOX_CONNECT_TIMEOUT_MS")
                .unwrap_or(defaults.connect_timeout_ms),
            log_frames: env::var("CALLBOX_LOG_FRAMES")
                .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        }
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = Some(attempts);
        self
    }

    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.reconnect_interval_ms),
            self.reconnect_decay,
            Duration::from_millis(self.max_reconnect_interval_ms),
        )
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|value| value.trim().parse().ok())
}
