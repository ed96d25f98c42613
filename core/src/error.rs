//! Error types for the estimator
//!
//! Estimation-path conditions (stale updates, degenerate weights, negative time steps, use before
//! initialization) are not errors; they are reported through [`crate::TickOutcome`] and
//! [`crate::UpdateOutcome`]. Only configuration, I/O and inter-thread communication problems surface here.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FilterError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No acknowledgment from {target} within {timeout_ms} ms")]
    CommunicationTimeout { target: String, timeout_ms: u128 },

    #[error("Estimator stage `{0}` is no longer running")]
    Disconnected(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Parse error: {0}")]
    Parse(String),
}

impl From<serde_json::Error> for FilterError {
    fn from(e: serde_json::Error) -> Self {
        FilterError::Parse(e.to_string())
    }
}

impl From<serde_yaml::Error> for FilterError {
    fn from(e: serde_yaml::Error) -> Self {
        FilterError::Parse(e.to_string())
    }
}

impl From<toml::de::Error> for FilterError {
    fn from(e: toml::de::Error) -> Self {
        FilterError::Parse(e.to_string())
    }
}

impl From<toml::ser::Error> for FilterError {
    fn from(e: toml::ser::Error) -> Self {
        FilterError::Parse(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FilterError>;
