//! Owned-field diffing.
//!
//! The desired object defines the set of fields this controller owns. Fields present
//! only on the observed copy belong to someone else (defaulting, admission, other
//! controllers) and never appear in a patch.

use keel_core::{Error, Result};
use kube::core::DynamicObject;
use serde_json::Value as Json;

/// The parts of an object a controller may own: body fields plus metadata labels and annotations.
pub fn owned_view(obj: &DynamicObject) -> Result<Json> {
    let mut v = serde_json::to_value(obj).map_err(|e| Error::malformed("object", e))?;
    if let Some(map) = v.as_object_mut() {
        map.remove("apiVersion");
        map.remove("kind");
        // Status is a subresource with its own writer.
        map.remove("status");
        if let Some(Json::Object(meta)) = map.get_mut("metadata") {
            meta.retain(|k, _| k == "labels" || k == "annotations");
            if meta.is_empty() { map.remove("metadata"); }
        }
    }
    Ok(v)
}

/// Minimal merge patch taking `observed` to `desired` on the fields `desired` sets.
///
/// Objects recurse per key. Arrays are atomic under merge patch, so an array is
/// rewritten whole unless every desired element is already satisfied by the observed
/// element at the same index (server-side defaults inside elements do not count as drift).
/// `null` in `desired` means "not set" and is skipped.
pub fn owned_patch(desired: &Json, observed: &Json) -> Option<Json> {
    match (desired, observed) {
        (Json::Null, _) => None,
        (Json::Object(d), Json::Object(o)) => {
            let mut patch = serde_json::Map::new();
            for (k, dv) in d.iter() {
                match o.get(k) {
                    Some(ov) => {
                        if let Some(p) = owned_patch(dv, ov) { patch.insert(k.clone(), p); }
                    }
                    None if dv.is_null() => {}
                    None => { patch.insert(k.clone(), dv.clone()); }
                }
            }
            if patch.is_empty() { None } else { Some(Json::Object(patch)) }
        }
        (Json::Array(d), Json::Array(o)) => {
            let satisfied = d.len() == o.len() && d.iter().zip(o.iter()).all(|(dv, ov)| owned_patch(dv, ov).is_none());
            if satisfied { None } else { Some(desired.clone()) }
        }
        (d, o) => if d == o { None } else { Some(d.clone()) },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owned_view_prunes_server_fields() {
        let obj: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "x",
                "namespace": "ns",
                "labels": { "app": "x" },
                "managedFields": [ {"foo": "bar"} ],
                "resourceVersion": "123",
                "uid": "u"
            },
            "status": { "obs": true },
            "data": { "k": "v" }
        })).unwrap();
        let v = owned_view(&obj).unwrap();
        assert_eq!(v, serde_json::json!({ "metadata": { "labels": { "app": "x" } }, "data": { "k": "v" } }));
    }

    #[test]
    fn unowned_fields_never_enter_the_patch() {
        let observed = serde_json::json!({ "spec": { "replicas": 1, "paused": false }, "extra": 7 });
        let desired = serde_json::json!({ "spec": { "replicas": 2 } });
        assert_eq!(owned_patch(&desired, &observed), Some(serde_json::json!({ "spec": { "replicas": 2 } })));
        assert_eq!(owned_patch(&serde_json::json!({ "spec": { "replicas": 1 } }), &observed), None);
    }

    #[test]
    fn defaulted_array_elements_are_not_drift() {
        let observed = serde_json::json!({ "ports": [{ "port": 80, "protocol": "TCP", "targetPort": 80 }] });
        let desired = serde_json::json!({ "ports": [{ "port": 80 }] });
        assert_eq!(owned_patch(&desired, &observed), None);
        let changed = serde_json::json!({ "ports": [{ "port": 81 }] });
        assert_eq!(owned_patch(&changed, &observed), Some(changed.clone()));
        let longer = serde_json::json!({ "ports": [{ "port": 80 }, { "port": 81 }] });
        assert_eq!(owned_patch(&longer, &observed), Some(longer.clone()));
    }
}
