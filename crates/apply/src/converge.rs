use std::sync::Arc;

use keel_core::{resource_version, Error, Kind, ObjectKey, ObjectStore, Result};
use kube::core::DynamicObject;
use metrics::counter;
use tracing::{debug, info};

use crate::diff::{owned_patch, owned_view};
use crate::owner::assign_owner;

/// Drives a single dependent object to its desired shape: create when absent, patch the
/// owned fields when they drifted, otherwise leave it alone. At most one write per call.
#[derive(Clone)]
pub struct Converger {
    store: Arc<dyn ObjectStore>,
}

impl Converger {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self { Self { store } }

    /// Converge `desired` (of kind `kind`) under the controlling owner `owner`.
    ///
    /// Returns whether a write was issued. A stale resourceVersion surfaces as
    /// [`Error::Conflict`]; a foreign controlling owner as [`Error::InvariantViolation`].
    pub async fn converge(&self, mut desired: DynamicObject, kind: &Kind, owner: &DynamicObject) -> Result<bool> {
        match &desired.types {
            None => desired.types = Some(kind.type_meta()),
            Some(t) if Kind::from_api_version(&t.api_version, &t.kind) != *kind => {
                return Err(Error::malformed("desired object", format!("declares {}/{} but {} was expected", t.api_version, t.kind, kind)));
            }
            Some(_) => {}
        }
        let key = ObjectKey::of(&desired)?;

        let Some(observed) = self.store.get(&key).await? else {
            assign_owner(&mut desired, owner)?;
            self.store.create(&desired).await?;
            counter!("converge_created", 1u64);
            info!(%key, "created");
            return Ok(true);
        };

        // Ownership is checked against the live copy so a foreign controller is never overwritten.
        let mut owned_refs = observed.clone();
        assign_owner(&mut owned_refs, owner)?;

        let mut patch = owned_patch(&owned_view(&desired)?, &owned_view(&observed)?);
        if owned_refs.metadata.owner_references != observed.metadata.owner_references {
            let refs = serde_json::to_value(&owned_refs.metadata.owner_references).map_err(|e| Error::malformed("ownerReferences", e))?;
            let p = patch.get_or_insert_with(|| serde_json::json!({}));
            p["metadata"]["ownerReferences"] = refs;
        }

        let Some(patch) = patch else {
            counter!("converge_unchanged", 1u64);
            debug!(%key, "up to date");
            return Ok(false);
        };
        let rv = resource_version(&observed)?;
        self.store.patch(&key, rv, &patch).await?;
        counter!("converge_patched", 1u64);
        info!(%key, rv, "patched");
        Ok(true)
    }
}
