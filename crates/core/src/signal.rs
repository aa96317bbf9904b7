//! Step outcomes and the rule for folding them over a step sequence.

use crate::{Error, ObjectKey};

/// Outcome of a single pipeline step.
///
/// Only `Continue` lets the sequence proceed; the first other variant is terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// Proceed to the next step.
    Continue,
    /// Stop; the resource is converged and needs no further scheduling.
    Halt,
    /// Stop and re-invoke later, without an error.
    Requeue,
    /// Stop and re-invoke with backoff, recording the error.
    RequeueWithError(Error),
    /// Stop with an error. Aggregates like `RequeueWithError`.
    Error(Error),
}

impl Signal {
    pub fn is_continue(&self) -> bool { matches!(self, Signal::Continue) }

    pub fn error(&self) -> Option<&Error> {
        match self {
            Signal::RequeueWithError(e) | Signal::Error(e) => Some(e),
            _ => None,
        }
    }

    /// Classify a store/engine error into the signal a step should return.
    pub fn from_error(err: Error) -> Self {
        match err {
            Error::NotFound(_) => Signal::Halt,
            e @ Error::InvariantViolation { .. } => Signal::Error(e),
            e => Signal::RequeueWithError(e),
        }
    }

    /// Classify an error raised while reconciling `resource`. Only the resource itself
    /// going missing is a clean halt; a missing dependency or namespace is retried.
    pub fn for_request(err: Error, resource: &ObjectKey) -> Self {
        if matches!(&err, Error::NotFound(k) if k != resource) {
            return Signal::RequeueWithError(err);
        }
        Signal::from_error(err)
    }

    /// `Continue` on success, classified error otherwise.
    pub fn from_result<T>(res: crate::Result<T>) -> Self {
        match res {
            Ok(_) => Signal::Continue,
            Err(e) => Signal::from_error(e),
        }
    }

    /// Map onto the scheduler's requeue contract.
    pub fn schedule(&self) -> Schedule {
        match self {
            Signal::Continue | Signal::Halt => Schedule::Done,
            Signal::Requeue => Schedule::Requeue,
            Signal::RequeueWithError(_) | Signal::Error(_) => Schedule::Backoff,
        }
    }
}

/// What the external scheduler should do once a pipeline has finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Do not reschedule; wait for the next watch notification.
    Done,
    /// Reschedule without error.
    Requeue,
    /// Reschedule with backoff and log the error.
    Backoff,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Kind;

    fn key() -> ObjectKey { ObjectKey::namespaced(Kind::new("", "v1", "ConfigMap"), "ns", "x") }

    #[test]
    fn errors_classify_into_signals() {
        assert_eq!(Signal::from_error(Error::NotFound(key())), Signal::Halt);
        let conflict = Error::Conflict { key: key(), seen: "3".into() };
        assert_eq!(Signal::from_error(conflict.clone()), Signal::RequeueWithError(conflict));
        let upstream = Error::upstream("patch", &key(), "forbidden");
        assert!(matches!(Signal::from_error(upstream), Signal::RequeueWithError(_)));
        let inv = Error::InvariantViolation { key: key(), reason: "owned elsewhere".into() };
        assert!(matches!(Signal::from_error(inv), Signal::Error(_)));
    }

    #[test]
    fn only_the_requested_resource_vanishing_halts() {
        let hs = ObjectKey::namespaced(Kind::new("matrix.keel.dev", "v1alpha1", "Homeserver"), "ns", "hs");
        assert_eq!(Signal::for_request(Error::NotFound(hs.clone()), &hs), Signal::Halt);
        let dep = Signal::for_request(Error::NotFound(key()), &hs);
        assert_eq!(dep, Signal::RequeueWithError(Error::NotFound(key())));
        let inv = Error::InvariantViolation { key: key(), reason: "x".into() };
        assert!(matches!(Signal::for_request(inv, &hs), Signal::Error(_)));
    }

    #[test]
    fn schedule_mapping() {
        assert_eq!(Signal::Halt.schedule(), Schedule::Done);
        assert_eq!(Signal::Requeue.schedule(), Schedule::Requeue);
        assert_eq!(Signal::RequeueWithError(Error::NotFound(key())).schedule(), Schedule::Backoff);
        assert_eq!(Signal::Error(Error::NotFound(key())).schedule(), Schedule::Backoff);
    }
}
