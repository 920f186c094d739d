use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, JsonSchema, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct ResolveConfig {
    /// How far a field error travels up the response.
    ///
    /// Can also be set via the `LOADER_ERROR_BEHAVIOR` environment variable.
    #[serde(default)]
    pub error_behavior: ErrorBehaviorConfig,

    /// Drops `locations` from errors returned by data sources.
    #[serde(default)]
    pub omit_error_locations: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum ErrorBehaviorConfig {
    /// Null the nearest nullable parent of the failing field.
    #[default]
    Propagate,
    /// Null the failing field only.
    Null,
    /// Null the whole `data` on the first error.
    Halt,
}

impl ErrorBehaviorConfig {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorBehaviorConfig::Propagate => "PROPAGATE",
            ErrorBehaviorConfig::Null => "NULL",
            ErrorBehaviorConfig::Halt => "HALT",
        }
    }
}

impl FromStr for ErrorBehaviorConfig {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "PROPAGATE" => Ok(ErrorBehaviorConfig::Propagate),
            "NULL" => Ok(ErrorBehaviorConfig::Null),
            "HALT" => Ok(ErrorBehaviorConfig::Halt),
            _ => Err(format!("Invalid error behavior: {}", s)),
        }
    }
}
