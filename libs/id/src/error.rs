//! Error types for key and uid parsing.

use thiserror::Error;

/// Errors that can occur when parsing or validating identifiers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The identifier string is empty.
    #[error("identifier cannot be empty")]
    Empty,

    /// The uid has an invalid prefix.
    #[error("invalid uid prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    /// The uid is missing the underscore separator.
    #[error("uid missing underscore separator")]
    MissingSeparator,

    /// The ULID portion of the uid is invalid.
    #[error("invalid ULID: {0}")]
    InvalidUlid(String),

    /// A namespace or name segment is not a valid label.
    #[error("invalid {segment} '{value}': {reason}")]
    InvalidSegment {
        segment: &'static str,
        value: String,
        reason: &'static str,
    },
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }
}
