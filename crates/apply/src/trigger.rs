use keel_core::{ObjectKey, Result};
use metrics::counter;
use tracing::info;

use crate::StatusPatcher;

/// Wakes another resource's control loop by raising its `needsReconcile` flag.
///
/// The target's own pipeline must clear the flag once it has acted on it.
#[derive(Clone)]
pub struct Trigger {
    status: StatusPatcher,
}

impl Trigger {
    pub fn new(status: StatusPatcher) -> Self { Self { status } }

    /// Returns whether the flag was raised. A missing target is a no-op, not an error.
    pub async fn request_reconcile(&self, target: &ObjectKey) -> Result<bool> {
        match self.status.modify_status(target, |s| s.needs_reconcile = true).await {
            Ok(raised) => {
                if raised {
                    counter!("trigger_raised", 1u64);
                    info!(%target, "requested reconcile");
                }
                Ok(raised)
            }
            Err(e) if e.is_not_found() => {
                info!(%target, "trigger target not found; nothing to wake");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}
