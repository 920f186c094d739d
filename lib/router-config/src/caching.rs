use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, JsonSchema, Clone)]
#[serde(deny_unknown_fields)]
pub struct CachingConfig {
    /// Enables the request-scoped entity cache.
    ///
    /// Can also be set via the `LOADER_L1_CACHE_ENABLED` environment variable.
    #[serde(default = "default_enabled")]
    pub l1_enabled: bool,

    /// Enables the external cache shared between requests.
    ///
    /// Can also be set via the `LOADER_L2_CACHE_ENABLED` environment variable.
    #[serde(default = "default_enabled")]
    pub l2_enabled: bool,

    /// TTL of L2 entries written by fetches that do not configure one.
    ///
    /// Default: `60s`.
    #[serde(
        default = "default_ttl",
        deserialize_with = "humantime_serde::deserialize",
        serialize_with = "humantime_serde::serialize"
    )]
    #[schemars(with = "String")]
    pub default_ttl: Duration,

    /// Maximum number of entries held by the bundled in-memory L2 cache.
    #[serde(default = "default_in_memory_max_capacity")]
    pub in_memory_max_capacity: u64,
}

impl Default for CachingConfig {
    fn default() -> Self {
        Self {
            l1_enabled: default_enabled(),
            l2_enabled: default_enabled(),
            default_ttl: default_ttl(),
            in_memory_max_capacity: default_in_memory_max_capacity(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_ttl() -> Duration {
    Duration::from_secs(60)
}

fn default_in_memory_max_capacity() -> u64 {
    10_000
}
