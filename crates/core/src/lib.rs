//! Keel core: object identity, step signals, status records and the store contract.

#![forbid(unsafe_code)]

use std::fmt;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::{DynamicObject, GroupVersionKind, TypeMeta};
use serde::{Deserialize, Serialize};

mod error;
mod signal;
mod status;

pub use error::{Error, Result};
pub use signal::{Schedule, Signal};
pub use status::{State, StatusRecord};

pub mod prelude {
    pub use super::{Error, Kind, ObjectKey, ObjectStore, ReconcileRequest, Result, Schedule, Signal, State, StatusRecord};
}

/// Group/version/kind of a stored object. Core kinds have an empty group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Kind {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Kind {
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self { group: group.to_string(), version: version.to_string(), kind: kind.to_string() }
    }

    /// Parse `v1/Kind` or `group/v1/Kind`.
    pub fn parse(key: &str) -> Result<Self> {
        let parts: Vec<_> = key.split('/').collect();
        match parts.as_slice() {
            [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(Self::new("", version, kind)),
            [group, version, kind] if !version.is_empty() && !kind.is_empty() => Ok(Self::new(group, version, kind)),
            _ => Err(Error::malformed("kind key", format!("{key} (expect v1/Kind or group/v1/Kind)"))),
        }
    }

    /// Split an `apiVersion` string (`v1` or `group/v1`) into a kind.
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        match api_version.split_once('/') {
            Some((g, v)) => Self::new(g, v, kind),
            None => Self::new("", api_version, kind),
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    pub fn gvk(&self) -> GroupVersionKind { GroupVersionKind::gvk(&self.group, &self.version, &self.kind) }

    pub fn type_meta(&self) -> TypeMeta { TypeMeta { api_version: self.api_version(), kind: self.kind.clone() } }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() { write!(f, "{}/{}", self.version, self.kind) } else { write!(f, "{}/{}/{}", self.group, self.version, self.kind) }
    }
}

/// Identity of a stored object: (kind, namespace, name).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub kind: Kind,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn namespaced(kind: Kind, namespace: &str, name: &str) -> Self {
        Self { kind, namespace: Some(namespace.to_string()), name: name.to_string() }
    }

    pub fn cluster(kind: Kind, name: &str) -> Self { Self { kind, namespace: None, name: name.to_string() } }

    /// Derive the key from an object's type meta and metadata.
    pub fn of(obj: &DynamicObject) -> Result<Self> {
        let types = obj.types.as_ref().ok_or_else(|| Error::malformed("object", "missing apiVersion/kind"))?;
        let name = obj.metadata.name.clone().ok_or_else(|| Error::malformed("object", "missing metadata.name"))?;
        Ok(Self { kind: Kind::from_api_version(&types.api_version, &types.kind), namespace: obj.metadata.namespace.clone(), name })
    }

    /// Same namespace and name, another kind.
    pub fn with_kind(&self, kind: Kind) -> Self { Self { kind, ..self.clone() } }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// Request to re-evaluate one resource. Carries no payload: the current copy is always re-fetched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ReconcileRequest {
    pub key: ObjectKey,
}

impl ReconcileRequest {
    pub fn new(key: ObjectKey) -> Self { Self { key } }
    pub fn namespace(&self) -> Option<&str> { self.key.namespace.as_deref() }
    pub fn name(&self) -> &str { &self.key.name }
}

impl From<ObjectKey> for ReconcileRequest {
    fn from(key: ObjectKey) -> Self { Self { key } }
}

/// The controlling owner reference of an object, if any.
pub fn controller_of(obj: &DynamicObject) -> Option<&OwnerReference> {
    obj.metadata.owner_references.as_ref()?.iter().find(|r| r.controller == Some(true))
}

/// Opaque version token of a stored object.
pub fn resource_version(obj: &DynamicObject) -> Result<&str> {
    obj.metadata.resource_version.as_deref().ok_or_else(|| Error::malformed("object", "missing metadata.resourceVersion"))
}

/// Control-plane store contract.
///
/// `patch` and `patch_status` take JSON merge patches and the caller's last-seen
/// resourceVersion; a stale version fails with [`Error::Conflict`]. Deleting an owner
/// cascades to every object it controls.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>>;
    async fn list(&self, kind: &Kind, namespace: Option<&str>) -> Result<Vec<DynamicObject>>;
    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject>;
    async fn patch(&self, key: &ObjectKey, resource_version: &str, patch: &serde_json::Value) -> Result<DynamicObject>;
    async fn patch_status(&self, key: &ObjectKey, resource_version: &str, status: &serde_json::Value) -> Result<DynamicObject>;
    async fn delete(&self, key: &ObjectKey) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_keys_parse_and_render() {
        let core = Kind::parse("v1/ConfigMap").unwrap();
        assert_eq!(core.api_version(), "v1");
        assert_eq!(core.to_string(), "v1/ConfigMap");
        let crd = Kind::parse("matrix.keel.dev/v1alpha1/Homeserver").unwrap();
        assert_eq!(crd.api_version(), "matrix.keel.dev/v1alpha1");
        assert_eq!(Kind::from_api_version("apps/v1", "Deployment"), Kind::new("apps", "v1", "Deployment"));
        let e = Kind::parse("Deployment").unwrap_err().to_string();
        assert!(e.contains("expect v1/Kind"), "e={}", e);
    }

    #[test]
    fn object_key_from_object() {
        let obj: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "apps/v1", "kind": "Deployment",
            "metadata": { "name": "web", "namespace": "ns" }
        })).unwrap();
        let key = ObjectKey::of(&obj).unwrap();
        assert_eq!(key, ObjectKey::namespaced(Kind::new("apps", "v1", "Deployment"), "ns", "web"));
        assert_eq!(key.to_string(), "apps/v1/Deployment ns/web");
    }
}
