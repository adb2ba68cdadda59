//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context. Runtime failures are wrapped into an
//! [`Escalation`](crate::escalation::Escalation) whose cause type is derived
//! from the variant via [`Error::cause_type`].

use thiserror::Error;

use crate::escalation::CauseType;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the office kernel.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid meta-data or arguments.
    #[error("validation error: {0}")]
    Validation(String),

    /// Unknown office, function or index.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid state transition.
    #[error("state transition error: {0}")]
    StateTransition(String),

    /// Internal errors (includes panics recovered from user code).
    #[error("internal error: {0}")]
    Internal(String),

    /// Work abandoned because its team or office stopped.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Asset timed out (managed object sourcing, asynchronous flow).
    #[error("timeout: {0}")]
    Timeout(String),

    /// Managed object source reported a failure.
    #[error("sourcing failed: {0}")]
    Sourcing(String),

    /// Governance logic failed.
    #[error("governance failure: {0}")]
    Governance(String),

    /// Failure raised by function logic with its own cause type.
    #[error("{cause_type}: {message}")]
    Function {
        cause_type: CauseType,
        message: String,
    },

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Cause type used to match escalation handlers.
    pub fn cause_type(&self) -> CauseType {
        match self {
            Error::Validation(_) => CauseType::new("validation"),
            Error::NotFound(_) => CauseType::new("not_found"),
            Error::StateTransition(_) => CauseType::new("state_transition"),
            Error::Internal(_) => CauseType::new("internal"),
            Error::Cancelled(_) => CauseType::new("cancelled"),
            Error::Timeout(_) => CauseType::new("timeout"),
            Error::Sourcing(_) => CauseType::new("sourcing"),
            Error::Governance(_) => CauseType::new("governance"),
            Error::Function { cause_type, .. } => cause_type.clone(),
            Error::Serialization(_) => CauseType::new("io.serialization"),
            Error::Io(_) => CauseType::new("io"),
        }
    }
}

// Convenience constructors
impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn state_transition(msg: impl Into<String>) -> Self {
        Self::StateTransition(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn sourcing(msg: impl Into<String>) -> Self {
        Self::Sourcing(msg.into())
    }

    pub fn governance(msg: impl Into<String>) -> Self {
        Self::Governance(msg.into())
    }

    /// Failure raised by function logic, e.g. `Error::function("order.invalid", "no lines")`.
    pub fn function(cause_type: impl Into<CauseType>, msg: impl Into<String>) -> Self {
        Self::Function {
            cause_type: cause_type.into(),
            message: msg.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cause_type_per_variant() {
        assert_eq!(Error::timeout("x").cause_type().as_str(), "timeout");
        assert_eq!(Error::sourcing("x").cause_type().as_str(), "sourcing");
        assert_eq!(
            Error::function("order.invalid", "x").cause_type().as_str(),
            "order.invalid"
        );
    }

    #[test]
    fn test_function_error_display() {
        let err = Error::function("order.invalid", "no lines");
        assert_eq!(err.to_string(), "order.invalid: no lines");
    }
}
