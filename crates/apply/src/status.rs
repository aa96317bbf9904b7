use std::sync::Arc;

use keel_core::{resource_version, Error, ObjectKey, ObjectStore, Result, StatusRecord};
use metrics::counter;
use tracing::debug;

/// Writes status records, skipping writes that would not change anything.
///
/// An unconditional write re-delivers the resource to its own controller through the
/// watch, so every path here compares against the freshly fetched copy first.
#[derive(Clone)]
pub struct StatusPatcher {
    store: Arc<dyn ObjectStore>,
}

impl StatusPatcher {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self { Self { store } }

    /// Persist `candidate` as the status of `key`. Returns whether a patch was issued.
    pub async fn update_status(&self, key: &ObjectKey, candidate: &StatusRecord) -> Result<bool> {
        self.modify_status(key, |s| *s = candidate.clone()).await
    }

    /// Read-modify-write on the latest persisted status, using its resourceVersion.
    pub async fn modify_status(&self, key: &ObjectKey, f: impl FnOnce(&mut StatusRecord) + Send) -> Result<bool> {
        let current = self.store.get(key).await?.ok_or_else(|| Error::NotFound(key.clone()))?;
        let persisted = StatusRecord::of(&current)?;
        let mut next = persisted.clone();
        f(&mut next);
        if next == persisted {
            counter!("status_unchanged", 1u64);
            debug!(%key, "status unchanged; skipping write");
            return Ok(false);
        }
        self.store.patch_status(key, resource_version(&current)?, &next.to_json()).await?;
        counter!("status_patched", 1u64);
        debug!(%key, state = ?next.state, reason = %next.reason, needs_reconcile = next.needs_reconcile, "status patched");
        Ok(true)
    }

    /// Mark `key` failed with `reason`, leaving its trigger flag as is.
    pub async fn set_failed(&self, key: &ObjectKey, reason: &str) -> Result<bool> {
        self.modify_status(key, |s| {
            s.state = keel_core::State::Failed;
            s.reason = reason.to_string();
        })
        .await
    }
}
