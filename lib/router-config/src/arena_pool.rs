use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Pool of arenas used to build batch inputs.
#[derive(Debug, Deserialize, Serialize, JsonSchema, Clone)]
#[serde(deny_unknown_fields)]
pub struct ArenaPoolSettings {
    /// Pooled arenas unused for longer than this are dropped.
    ///
    /// Default: `30s`.
    #[serde(
        default = "default_idle_timeout",
        deserialize_with = "humantime_serde::deserialize",
        serialize_with = "humantime_serde::serialize"
    )]
    #[schemars(with = "String")]
    pub idle_timeout: Duration,

    /// Number of releases averaged to size new arenas.
    #[serde(default = "default_peak_window")]
    pub peak_window: usize,

    /// Smallest size, in bytes, a new arena is created with.
    #[serde(default = "default_min_capacity")]
    pub min_capacity: usize,
}

impl Default for ArenaPoolSettings {
    fn default() -> Self {
        Self {
            idle_timeout: default_idle_timeout(),
            peak_window: default_peak_window(),
            min_capacity: default_min_capacity(),
        }
    }
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_peak_window() -> usize {
    50
}

fn default_min_capacity() -> usize {
    1024
}
