//! Operation-boundary error: a kind plus a message the operator can act on.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use fieldstock_core::DomainError;

use crate::event_store::EventStoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed or missing input; nothing was written.
    Validation,
    /// A business rule refused the operation (insufficient stock, wrong status, ...).
    Conflict,
    /// A referenced entity does not exist or is inactive.
    NotFound,
    /// Another operation committed first. Retried internally; exhausted retries surface
    /// as [`ErrorKind::Conflict`].
    Concurrency,
    /// Storage failure; details are in the logs.
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Conflict => "conflict",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Concurrency => "concurrency",
            ErrorKind::Internal => "internal",
        }
    }
}

impl core::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct OperationError {
    pub kind: ErrorKind,
    pub message: String,
}

pub type OperationResult<T> = Result<T, OperationError>;

impl OperationError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn not_found(what: impl core::fmt::Display) -> Self {
        Self::new(ErrorKind::NotFound, format!("{what} not found"))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn is_concurrency(&self) -> bool {
        self.kind == ErrorKind::Concurrency
    }

    /// Prefix the message with the operator-facing context (e.g. `line 2`).
    pub fn context(mut self, context: impl core::fmt::Display) -> Self {
        self.message = format!("{context}: {}", self.message);
        self
    }
}

impl From<DomainError> for OperationError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) => OperationError::validation(msg),
            DomainError::InvalidId(msg) => OperationError::validation(msg),
            DomainError::InvariantViolation(msg) => OperationError::conflict(msg),
            DomainError::Conflict(msg) => OperationError::conflict(msg),
            DomainError::NotFound(what) => OperationError::not_found(what),
        }
    }
}

impl From<EventStoreError> for OperationError {
    fn from(value: EventStoreError) -> Self {
        match value {
            EventStoreError::Concurrency(msg) => OperationError::new(ErrorKind::Concurrency, msg),
            EventStoreError::Projection(msg) => {
                tracing::warn!(error = %msg, "projection refused commit");
                OperationError::conflict(msg)
            }
            other => {
                tracing::error!(error = %other, "event store failure");
                OperationError::internal("internal storage error")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invariant_violations_surface_as_conflicts() {
        let err: OperationError = DomainError::invariant("order is cancelled").into();
        assert_eq!(err.kind, ErrorKind::Conflict);
        assert_eq!(err.to_string(), "conflict: order is cancelled");
    }

    #[test]
    fn storage_failures_are_generic() {
        let err: OperationError = EventStoreError::Database("connection reset by peer".into()).into();
        assert_eq!(err.kind, ErrorKind::Internal);
        assert!(!err.message.contains("peer"));
    }

    #[test]
    fn not_found_names_the_entity() {
        let err: OperationError = DomainError::not_found("purchase order PO-7").into();
        assert_eq!(err.message, "purchase order PO-7 not found");
        assert_eq!(err.clone().context("line 2").message, "line 2: purchase order PO-7 not found");
    }
}
