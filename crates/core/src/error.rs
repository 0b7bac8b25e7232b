//! # Error Handling Framework
//!
//! Structured error type shared by every AegisShield crate. An [`Error`]
//! carries a stable [`ErrorKind`] taxonomy value, a human-readable message,
//! the operation that produced it, and a correlation id for cross-service
//! tracing. Layers wrap downstream errors with context but never change the
//! kind, so retry decisions made near the I/O boundary stay visible to the
//! caller.
//!
//! ## Retry semantics
//!
//! - `Transient` and `Timeout` are retryable with backoff.
//! - `Overloaded` asks the caller to back off before retrying.
//! - `Invalid`, `Conflict`, `Permanent`, `Unauthorized` must not be retried.
//!
//! Retries are performed only at the lowest layer that knows the idempotency
//! characteristics of the call; upper layers observe post-retry outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, Error>;

/// Stable error taxonomy shared by all components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Caller error; never retry.
    Invalid,
    /// Referenced entity does not exist.
    NotFound,
    /// Invariant violation or concurrent modification.
    Conflict,
    /// Resource saturated; caller should back off.
    Overloaded,
    /// Deadline exceeded; in-flight I/O was cancelled.
    Timeout,
    /// Retryable with backoff.
    Transient,
    /// Not retryable; surface to the operator.
    Permanent,
    /// Authentication or authorization failure.
    Unauthorized,
}

impl ErrorKind {
    /// Whether an operation failing with this kind may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Transient | ErrorKind::Timeout)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Invalid => "invalid",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Overloaded => "overloaded",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Unauthorized => "unauthorized",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for the AegisShield core.
#[derive(Debug, Clone)]
pub struct Error {
    /// Taxonomy kind; preserved across layer boundaries.
    pub kind: ErrorKind,
    /// Human-readable error message.
    pub message: String,
    /// Operation that produced the error, innermost first.
    pub operations: Vec<String>,
    /// Correlation id for tracing across services.
    pub correlation_id: Uuid,
    /// When the error was created.
    pub timestamp: DateTime<Utc>,
    /// Side effects that had already committed when the operation failed.
    /// A flushed batch is not rolled back on timeout; it is reported here.
    pub committed: Vec<String>,
    /// Optional cause chain.
    pub cause: Option<Box<Error>>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            operations: Vec::new(),
            correlation_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            committed: Vec::new(),
            cause: None,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Invalid, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn overloaded(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Overloaded, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permanent, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    /// Record the operation (and its key identifiers) this error passed
    /// through. Kind and correlation id are preserved.
    pub fn in_operation(mut self, operation: impl Into<String>) -> Self {
        self.operations.push(operation.into());
        self
    }

    /// Record a side effect that had already committed before the failure.
    pub fn with_committed(mut self, effect: impl Into<String>) -> Self {
        self.committed.push(effect.into());
        self
    }

    /// Chain with a downstream error as cause, preserving its kind.
    pub fn wrapping(cause: Error, operation: impl Into<String>) -> Self {
        let mut err = Error::new(cause.kind, cause.message.clone()).in_operation(operation);
        err.correlation_id = cause.correlation_id;
        err.committed = cause.committed.clone();
        err.cause = Some(Box::new(cause));
        err
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Structured error envelope for service transports.
    pub fn to_envelope(&self) -> serde_json::Value {
        serde_json::json!({
            "kind": self.kind,
            "message": self.message,
            "correlation_id": self.correlation_id,
        })
    }

    /// Single-line diagnostic for CLI output.
    pub fn to_diagnostic(&self) -> String {
        if self.operations.is_empty() {
            format!("{}: {}", self.kind, self.message)
        } else {
            format!(
                "{}: {} (in {})",
                self.kind,
                self.message,
                self.operations.join(" <- ")
            )
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)?;
        for op in &self.operations {
            write!(f, "; in {}", op)?;
        }
        if !self.committed.is_empty() {
            write!(f, "; committed: {}", self.committed.join(", "))?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_ref().map(|c| c.as_ref() as _)
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        let kind = match &err {
            sqlx::Error::RowNotFound => ErrorKind::NotFound,
            sqlx::Error::PoolTimedOut => ErrorKind::Timeout,
            sqlx::Error::Io(_) | sqlx::Error::PoolClosed => ErrorKind::Transient,
            sqlx::Error::Database(db) if db.is_unique_violation() => ErrorKind::Conflict,
            _ => ErrorKind::Permanent,
        };
        Error::new(kind, format!("database error: {}", err))
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        let kind = if err.is_timeout() {
            ErrorKind::Timeout
        } else if err.is_connection_refusal() || err.is_connection_dropped() || err.is_io_error() {
            ErrorKind::Transient
        } else {
            ErrorKind::Permanent
        };
        Error::new(kind, format!("bus error: {}", err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::new(ErrorKind::Invalid, format!("serialization error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapping_preserves_kind_and_correlation() {
        let inner = Error::transient("connection reset").in_operation("graph.bulk_upsert");
        let correlation = inner.correlation_id;

        let outer = Error::wrapping(inner, "ingest.flush_batch batch_id=b-17");

        assert_eq!(outer.kind, ErrorKind::Transient);
        assert_eq!(outer.correlation_id, correlation);
        assert!(outer.is_retryable());
        assert!(outer.to_diagnostic().contains("flush_batch"));
    }

    #[test]
    fn committed_side_effects_survive_wrapping() {
        let inner = Error::timeout("deadline exceeded").with_committed("batch b-3 flushed");
        let outer = Error::wrapping(inner, "pipeline.ingest_stream");

        assert_eq!(outer.committed, vec!["batch b-3 flushed".to_string()]);
    }

    #[test]
    fn envelope_has_taxonomy_fields() {
        let err = Error::overloaded("audit buffer full");
        let envelope = err.to_envelope();

        assert_eq!(envelope["kind"], "overloaded");
        assert!(envelope["correlation_id"].is_string());
    }

    #[test]
    fn retryability_follows_taxonomy() {
        assert!(ErrorKind::Transient.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(!ErrorKind::Invalid.is_retryable());
        assert!(!ErrorKind::Permanent.is_retryable());
        assert!(!ErrorKind::Overloaded.is_retryable());
    }
}
