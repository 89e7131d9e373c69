//! Typed errors surfaced by the library

use thiserror::Error;

/// Fatal problems with an input bar series. Aborts the run.
#[derive(Debug, Error, PartialEq)]
pub enum DataValidationError {
    #[error("missing required OHLCV columns: {}", .0.join(", "))]
    MissingColumns(Vec<String>),

    #[error("no parseable timestamp column (expected one of: date, datetime, timestamp, open_time)")]
    NoTimestampColumn,

    #[error("row {row}: cannot parse timestamp '{value}'")]
    InvalidTimestamp { row: usize, value: String },

    #[error("row {row}: cannot parse {column} value '{value}'")]
    InvalidNumber {
        row: usize,
        column: String,
        value: String,
    },

    #[error("row {row}: timestamp is not strictly after the previous bar")]
    NonMonotonicTimestamps { row: usize },

    #[error("row {row}: {reason}")]
    InvalidCandle { row: usize, reason: String },
}

/// Rejected strategy or account configuration
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("unknown grid parameter `{0}`")]
    UnknownGridParameter(String),
}

impl ConfigError {
    pub(crate) fn invalid(name: &str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidParameter {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}
