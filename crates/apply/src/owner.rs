use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use keel_core::{controller_of, Error, ObjectKey, Result};
use kube::core::DynamicObject;

/// Controlling owner reference pointing at `parent`.
pub fn owner_reference(parent: &DynamicObject) -> Result<OwnerReference> {
    let key = ObjectKey::of(parent)?;
    let uid = parent.metadata.uid.clone().ok_or_else(|| Error::malformed("owner", format!("{key} has no uid (not persisted yet?)")))?;
    Ok(OwnerReference {
        api_version: key.kind.api_version(),
        kind: key.kind.kind,
        name: key.name,
        uid,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

pub fn is_controlled_by(child: &DynamicObject, parent: &DynamicObject) -> bool {
    match (controller_of(child), parent.metadata.uid.as_deref()) {
        (Some(r), Some(uid)) => r.uid == uid,
        _ => false,
    }
}

/// Make `parent` the controlling owner of `child`.
///
/// Idempotent when `parent` already controls `child`. A child controlled by any other
/// object, or living in another namespace than its parent, is an invariant violation.
pub fn assign_owner(child: &mut DynamicObject, parent: &DynamicObject) -> Result<()> {
    let want = owner_reference(parent)?;
    let child_key = ObjectKey::of(child)?;
    if parent.metadata.namespace.is_some() && parent.metadata.namespace != child.metadata.namespace {
        return Err(Error::InvariantViolation {
            key: child_key,
            reason: format!("owner {}/{} lives in another namespace", want.kind, want.name),
        });
    }
    if let Some(cur) = controller_of(child) {
        if cur.uid == want.uid { return Ok(()); }
        return Err(Error::InvariantViolation {
            key: child_key,
            reason: format!("already controlled by {} {} (uid {})", cur.kind, cur.name, cur.uid),
        });
    }
    let refs = child.metadata.owner_references.get_or_insert_with(Vec::new);
    match refs.iter_mut().find(|r| r.uid == want.uid) {
        Some(existing) => {
            existing.controller = Some(true);
            existing.block_owner_deletion = Some(true);
        }
        None => refs.push(want),
    }
    Ok(())
}
