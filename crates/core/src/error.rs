//! Error taxonomy shared by every layer of the engine.

use thiserror::Error;

use crate::ObjectKey;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// Object vanished (or never existed). Terminal for a reconcile, never retried.
    #[error("{0} not found")]
    NotFound(ObjectKey),
    /// Write carried a stale resourceVersion.
    #[error("conflict writing {key}: resourceVersion {seen} is stale")]
    Conflict { key: ObjectKey, seen: String },
    /// Create raced with another writer.
    #[error("{0} already exists")]
    AlreadyExists(ObjectKey),
    /// Logic bug, e.g. a child controlled by a different parent. Not retried.
    #[error("invariant violated on {key}: {reason}")]
    InvariantViolation { key: ObjectKey, reason: String },
    /// Store rejected the request (permission, validation, transport).
    #[error("store rejected {op} on {key}: {message}")]
    Upstream { op: &'static str, key: ObjectKey, message: String },
    /// Object body or payload that cannot be decoded.
    #[error("malformed {what}: {message}")]
    Malformed { what: String, message: String },
}

impl Error {
    pub fn is_not_found(&self) -> bool { matches!(self, Error::NotFound(_)) }

    pub fn is_conflict(&self) -> bool { matches!(self, Error::Conflict { .. } | Error::AlreadyExists(_)) }

    /// Everything except invariant violations may succeed on a later attempt.
    /// Upstream errors count as retryable: permission grants take time to propagate.
    pub fn is_retryable(&self) -> bool { !matches!(self, Error::InvariantViolation { .. }) }

    pub fn malformed(what: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Error::Malformed { what: what.into(), message: message.to_string() }
    }

    pub fn upstream(op: &'static str, key: &ObjectKey, message: impl std::fmt::Display) -> Self {
        Error::Upstream { op, key: key.clone(), message: message.to_string() }
    }
}
