use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Capture of what every fetch sent and received.
#[derive(Debug, Deserialize, Serialize, JsonSchema, Clone)]
#[serde(deny_unknown_fields)]
pub struct TraceConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub exclude_raw_input_data: bool,

    #[serde(default)]
    pub exclude_input: bool,

    #[serde(default)]
    pub exclude_output: bool,

    /// Replaces credentials found in the `header` object of traced inputs.
    #[serde(default = "default_redact_headers")]
    pub redact_headers: bool,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            exclude_raw_input_data: false,
            exclude_input: false,
            exclude_output: false,
            redact_headers: default_redact_headers(),
        }
    }
}

fn default_redact_headers() -> bool {
    true
}
