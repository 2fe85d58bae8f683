//! Engine configuration.

use std::time::Duration;

use serde::Deserialize;

/// Tuning knobs for the engine.  Every field has a default so a partial
/// JSON document (or none at all) is enough.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How often retry, delay and timeout timers are evaluated.
    #[serde(with = "millis")]
    pub tick_interval: Duration,
    /// Retry interval used when a task definition leaves it at zero.
    #[serde(with = "millis")]
    pub default_retry_interval: Duration,
    /// Backfill parallelism used when a command asks for `0`.
    /// `0` here means unbounded.
    pub default_complement_parallelism: u32,
    /// Capacity of the notification broadcast channel.
    pub event_buffer: usize,
    /// Host name recorded on instances this engine drives.
    pub master_host: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(500),
            default_retry_interval: Duration::from_secs(60),
            default_complement_parallelism: 0,
            event_buffer: 1024,
            master_host: "localhost".to_owned(),
        }
    }
}

impl EngineConfig {
    /// Parse a JSON document; missing fields fall back to defaults.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
