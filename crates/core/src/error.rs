//! Domain error model.

use rust_decimal::Decimal;
use thiserror::Error;

use crate::value_object::{MAX_AMOUNT, SCALE};

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Failure of a pure domain check: input shape, identifiers and
/// fixed-point amounts.
///
/// Stock shortages and document status rules carry richer payloads and
/// live in their own crates (`LedgerError`, `DocumentError`).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Malformed or out-of-bounds input.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("{what} cannot be negative (got {value})")]
    Negative { what: &'static str, value: Decimal },

    #[error("{what} supports at most {scale} decimal places (got {value})", scale = SCALE)]
    TooPrecise { what: &'static str, value: Decimal },

    #[error("{what} cannot exceed {max} (got {value})", max = MAX_AMOUNT)]
    TooLarge { what: &'static str, value: Decimal },
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
