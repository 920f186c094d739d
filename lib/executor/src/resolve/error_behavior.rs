use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How far a field-level error bubbles up the response tree.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum ErrorBehavior {
    /// Null the nearest nullable ancestor, or the whole `data` when there is none.
    #[default]
    #[serde(alias = "propagate")]
    #[strum(serialize = "PROPAGATE")]
    Propagate,
    /// Null only the failing field.
    #[serde(alias = "null")]
    #[strum(serialize = "NULL")]
    Null,
    /// Null the whole `data` on the first error.
    #[serde(alias = "halt")]
    #[strum(serialize = "HALT")]
    Halt,
}

impl ErrorBehavior {
    /// Lenient parsing used for per-request values: case-insensitive, surrounding
    /// whitespace ignored. Unknown values fall back to `Propagate` and report `false`.
    pub fn parse(value: &str) -> (ErrorBehavior, bool) {
        match value.trim().parse::<ErrorBehavior>() {
            Ok(behavior) => (behavior, true),
            Err(_) => (ErrorBehavior::Propagate, false),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid error behavior '{0}', expected one of PROPAGATE, NULL, HALT")]
pub struct InvalidErrorBehavior(pub String);

impl FromStr for ErrorBehavior {
    type Err = InvalidErrorBehavior;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PROPAGATE" => Ok(ErrorBehavior::Propagate),
            "NULL" => Ok(ErrorBehavior::Null),
            "HALT" => Ok(ErrorBehavior::Halt),
            _ => Err(InvalidErrorBehavior(s.to_string())),
        }
    }
}
