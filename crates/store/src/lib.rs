//! Keel store: in-RAM control-plane store.
//!
//! Implements the same contract as the live cluster: resourceVersion tokens with
//! conflict detection, JSON merge patches, a separate status subresource, cascade
//! garbage collection through controlling owner references, and watch notifications
//! delivered as reconcile requests.

#![forbid(unsafe_code)]

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use keel_core::{controller_of, Error, Kind, ObjectKey, ObjectStore, ReconcileRequest, Result};
use kube::core::DynamicObject;
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tokio::sync::broadcast;
use tracing::debug;

/// Number of successful write calls, per operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteCounts {
    pub creates: u64,
    pub patches: u64,
    pub status_patches: u64,
    pub deletes: u64,
}

#[derive(Default)]
struct Inner {
    objects: FxHashMap<ObjectKey, DynamicObject>,
    next_rv: u64,
    counts: WriteCounts,
    fail_next: Option<Error>,
}

impl Inner {
    fn bump_rv(&mut self) -> String {
        self.next_rv += 1;
        self.next_rv.to_string()
    }

    /// Keys of every object transitively controlled by `uid`.
    fn dependents_of(&self, uid: &str) -> Vec<ObjectKey> {
        let mut out = Vec::new();
        let mut frontier = vec![uid.to_string()];
        while let Some(owner_uid) = frontier.pop() {
            for (k, o) in self.objects.iter() {
                if controller_of(o).map(|r| r.uid == owner_uid).unwrap_or(false) && !out.contains(k) {
                    out.push(k.clone());
                    if let Some(u) = o.metadata.uid.clone() { frontier.push(u); }
                }
            }
        }
        out
    }
}

/// A watch event carrying the object as written, or its last state before deletion.
#[derive(Debug, Clone)]
pub enum Change {
    Applied(DynamicObject),
    Deleted(DynamicObject),
}

impl Change {
    pub fn object(&self) -> &DynamicObject {
        match self {
            Change::Applied(o) | Change::Deleted(o) => o,
        }
    }
}

/// In-RAM store. Cheap to share behind an `Arc`.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    events: broadcast::Sender<ReconcileRequest>,
    changes: broadcast::Sender<Change>,
}

impl Default for MemoryStore {
    fn default() -> Self { Self::new() }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        let (changes, _) = broadcast::channel(1024);
        Self { inner: Mutex::new(Inner::default()), events, changes }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> { self.inner.lock().unwrap_or_else(|e| e.into_inner()) }

    /// Subscribe to watch notifications. Every write yields a request for the written
    /// object and, when it has one, for its controlling owner.
    pub fn subscribe(&self) -> broadcast::Receiver<ReconcileRequest> { self.events.subscribe() }

    /// Subscribe to object-level watch events, for mapping changes of one kind onto
    /// requests for another.
    pub fn watch(&self) -> broadcast::Receiver<Change> { self.changes.subscribe() }

    pub fn write_counts(&self) -> WriteCounts { self.lock().counts }

    pub fn len(&self) -> usize { self.lock().objects.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Fail the next write (create/patch/patch_status/delete) with `err`.
    pub fn fail_next_write(&self, err: Error) { self.lock().fail_next = Some(err); }

    /// Write an object as an external actor would, bypassing status separation.
    /// Returns the stored copy.
    pub fn seed(&self, mut obj: DynamicObject) -> Result<DynamicObject> {
        let key = ObjectKey::of(&obj)?;
        let mut inner = self.lock();
        let rv = inner.bump_rv();
        let prev = inner.objects.get(&key);
        obj.metadata.uid = prev.and_then(|p| p.metadata.uid.clone()).or_else(|| Some(uuid::Uuid::new_v4().to_string()));
        obj.metadata.creation_timestamp = prev.and_then(|p| p.metadata.creation_timestamp.clone()).or_else(|| Some(Time(chrono::Utc::now())));
        obj.metadata.resource_version = Some(rv);
        inner.objects.insert(key, obj.clone());
        drop(inner);
        self.publish(Change::Applied(obj.clone()));
        Ok(obj)
    }

    fn take_failure(&self) -> Result<()> {
        match self.lock().fail_next.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn notify(&self, obj: &DynamicObject) {
        let Ok(key) = ObjectKey::of(obj) else { return };
        if let Some(owner) = controller_of(obj) {
            let kind = Kind::from_api_version(&owner.api_version, &owner.kind);
            let owner_key = ObjectKey { kind, namespace: key.namespace.clone(), name: owner.name.clone() };
            let _ = self.events.send(ReconcileRequest::new(owner_key));
        }
        // No receivers is fine: nobody is watching.
        let _ = self.events.send(ReconcileRequest::new(key));
    }

    fn publish(&self, change: Change) {
        self.notify(change.object());
        let _ = self.changes.send(change);
    }

    fn write_patched(&self, key: &ObjectKey, resource_version: &str, apply: impl FnOnce(&mut Json)) -> Result<DynamicObject> {
        self.take_failure()?;
        let mut inner = self.lock();
        let cur = inner.objects.get(key).ok_or_else(|| Error::NotFound(key.clone()))?;
        if cur.metadata.resource_version.as_deref() != Some(resource_version) {
            return Err(Error::Conflict { key: key.clone(), seen: resource_version.to_string() });
        }
        let mut body = serde_json::to_value(cur).map_err(|e| Error::malformed("stored object", e))?;
        let before = body.clone();
        apply(&mut body);
        let mut next: DynamicObject = serde_json::from_value(body.clone()).map_err(|e| Error::malformed("patched object", e))?;
        // Identity and server-managed fields are immutable through patches.
        next.types = cur.types.clone();
        next.metadata.name = cur.metadata.name.clone();
        next.metadata.namespace = cur.metadata.namespace.clone();
        next.metadata.uid = cur.metadata.uid.clone();
        next.metadata.creation_timestamp = cur.metadata.creation_timestamp.clone();
        next.metadata.resource_version = cur.metadata.resource_version.clone();
        if body == before || serde_json::to_value(&next).ok().as_ref() == Some(&before) {
            debug!(%key, "patch produced no change");
            return Ok(cur.clone());
        }
        next.metadata.resource_version = Some(inner.bump_rv());
        inner.objects.insert(key.clone(), next.clone());
        drop(inner);
        self.publish(Change::Applied(next.clone()));
        Ok(next)
    }
}

/// RFC 7386 JSON merge patch.
pub fn merge_patch(target: &mut Json, patch: &Json) {
    let Json::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() { *target = Json::Object(serde_json::Map::new()); }
    if let Json::Object(tmap) = target {
        for (k, pv) in patch_map {
            if pv.is_null() {
                tmap.remove(k);
            } else {
                merge_patch(tmap.entry(k.clone()).or_insert(Json::Null), pv);
            }
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>> { Ok(self.lock().objects.get(key).cloned()) }

    async fn list(&self, kind: &Kind, namespace: Option<&str>) -> Result<Vec<DynamicObject>> {
        let inner = self.lock();
        let mut out: Vec<(ObjectKey, DynamicObject)> = inner
            .objects
            .iter()
            .filter(|(k, _)| &k.kind == kind && (namespace.is_none() || k.namespace.as_deref() == namespace))
            .map(|(k, o)| (k.clone(), o.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out.into_iter().map(|(_, o)| o).collect())
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        self.take_failure()?;
        let key = ObjectKey::of(obj)?;
        let mut inner = self.lock();
        if inner.objects.contains_key(&key) { return Err(Error::AlreadyExists(key)); }
        let mut stored = obj.clone();
        // Status is a subresource: ignored on create.
        if let Some(map) = stored.data.as_object_mut() { map.remove("status"); }
        stored.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        stored.metadata.creation_timestamp = Some(Time(chrono::Utc::now()));
        stored.metadata.resource_version = Some(inner.bump_rv());
        inner.objects.insert(key.clone(), stored.clone());
        inner.counts.creates += 1;
        drop(inner);
        debug!(%key, "created");
        self.publish(Change::Applied(stored.clone()));
        Ok(stored)
    }

    async fn patch(&self, key: &ObjectKey, resource_version: &str, patch: &Json) -> Result<DynamicObject> {
        let mut patch = patch.clone();
        // Status changes only through the status subresource.
        if let Some(map) = patch.as_object_mut() { map.remove("status"); }
        let out = self.write_patched(key, resource_version, |body| merge_patch(body, &patch))?;
        self.lock().counts.patches += 1;
        Ok(out)
    }

    async fn patch_status(&self, key: &ObjectKey, resource_version: &str, status: &Json) -> Result<DynamicObject> {
        let patch = serde_json::json!({ "status": status });
        let out = self.write_patched(key, resource_version, |body| merge_patch(body, &patch))?;
        self.lock().counts.status_patches += 1;
        Ok(out)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        self.take_failure()?;
        let mut inner = self.lock();
        let obj = inner.objects.remove(key).ok_or_else(|| Error::NotFound(key.clone()))?;
        inner.counts.deletes += 1;
        let mut removed = vec![obj.clone()];
        if let Some(uid) = obj.metadata.uid.as_deref() {
            for dep in inner.dependents_of(uid) {
                if let Some(o) = inner.objects.remove(&dep) {
                    debug!(owner = %key, dependent = %dep, "garbage collected");
                    removed.push(o);
                }
            }
        }
        drop(inner);
        for o in removed { self.publish(Change::Deleted(o)); }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_patch_follows_rfc7386() {
        let mut target = serde_json::json!({ "a": "b", "c": { "d": "e", "f": "g" }, "l": [1, 2] });
        merge_patch(&mut target, &serde_json::json!({ "a": "z", "c": { "f": null }, "l": [3] }));
        assert_eq!(target, serde_json::json!({ "a": "z", "c": { "d": "e" }, "l": [3] }));
    }
}
