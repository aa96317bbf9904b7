//! Keel kubehub: the [`ObjectStore`] contract on top of a live API server.
//!
//! Resources are resolved through discovery once per kind and cached. Spec writes go
//! through JSON merge patches carrying `metadata.resourceVersion`, so the API server
//! enforces optimistic concurrency; status writes use the status subresource.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use keel_core::{Error, Kind, ObjectKey, ObjectStore, Result};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject},
    discovery::{self, Scope},
    Client,
};
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tokio::sync::RwLock;
use tracing::{debug, info};

pub const DEFAULT_FIELD_MANAGER: &str = "keel";

/// Field manager recorded on every write, from `KEEL_FIELD_MANAGER`.
pub fn field_manager_from_env() -> String {
    std::env::var("KEEL_FIELD_MANAGER").ok().filter(|s| !s.trim().is_empty()).unwrap_or_else(|| DEFAULT_FIELD_MANAGER.to_string())
}

#[derive(Debug, Clone)]
struct Resolved {
    resource: ApiResource,
    namespaced: bool,
}

pub struct KubeStore {
    client: Client,
    field_manager: String,
    resources: RwLock<FxHashMap<Kind, Resolved>>,
}

impl KubeStore {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self { client, field_manager: field_manager.into(), resources: RwLock::new(FxHashMap::default()) }
    }

    /// Connect with the ambient kubeconfig or in-cluster service account.
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default().await.map_err(|e| Error::malformed("kube client config", e))?;
        Ok(Self::new(client, field_manager_from_env()))
    }

    pub fn client(&self) -> Client { self.client.clone() }

    /// Discovery lookup for `kind`, cached after the first hit.
    pub async fn api_resource(&self, kind: &Kind) -> Result<(ApiResource, bool)> {
        if let Some(r) = self.resources.read().await.get(kind) {
            return Ok((r.resource.clone(), r.namespaced));
        }
        let (resource, caps) = discovery::pinned_kind(&self.client, &kind.gvk())
            .await
            .map_err(|e| Error::malformed(format!("kind {kind}"), format!("not served: {e}")))?;
        let namespaced = matches!(caps.scope, Scope::Namespaced);
        debug!(%kind, plural = %resource.plural, namespaced, "resolved api resource");
        self.resources.write().await.insert(kind.clone(), Resolved { resource: resource.clone(), namespaced });
        Ok((resource, namespaced))
    }

    /// Api handle for `kind`, scoped to `namespace` when the kind is namespaced.
    pub async fn api(&self, kind: &Kind, namespace: Option<&str>) -> Result<Api<DynamicObject>> {
        let (ar, namespaced) = self.api_resource(kind).await?;
        Ok(match (namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        })
    }

    fn patch_params(&self) -> PatchParams { PatchParams { field_manager: Some(self.field_manager.clone()), ..Default::default() } }
}

/// Map API failures onto the engine taxonomy. 404 and 409 carry meaning; everything
/// else is an upstream rejection.
fn map_err(op: &'static str, key: &ObjectKey, seen: Option<&str>, err: kube::Error) -> Error {
    match &err {
        kube::Error::Api(ae) if ae.code == 404 => Error::NotFound(key.clone()),
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => Error::AlreadyExists(key.clone()),
        kube::Error::Api(ae) if ae.code == 409 => Error::Conflict { key: key.clone(), seen: seen.unwrap_or_default().to_string() },
        _ => Error::upstream(op, key, err),
    }
}

/// List items come back without type metadata and with server bookkeeping attached.
fn tidy(mut obj: DynamicObject, kind: &Kind) -> DynamicObject {
    if obj.types.is_none() {
        obj.types = Some(kind.type_meta());
    }
    obj.metadata.managed_fields = None;
    obj
}

fn with_resource_version(patch: &Json, resource_version: &str) -> Json {
    let mut patch = patch.clone();
    if !patch.is_object() {
        patch = serde_json::json!({});
    }
    if let Some(map) = patch.as_object_mut() {
        map.remove("status");
        let meta = map.entry("metadata").or_insert_with(|| serde_json::json!({}));
        if let Some(meta) = meta.as_object_mut() {
            meta.insert("resourceVersion".into(), Json::String(resource_version.to_string()));
        }
    }
    patch
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>> {
        let api = self.api(&key.kind, key.namespace.as_deref()).await?;
        let obj = api.get_opt(&key.name).await.map_err(|e| map_err("get", key, None, e))?;
        Ok(obj.map(|o| tidy(o, &key.kind)))
    }

    async fn list(&self, kind: &Kind, namespace: Option<&str>) -> Result<Vec<DynamicObject>> {
        let api = self.api(kind, namespace).await?;
        let scope = ObjectKey { kind: kind.clone(), namespace: namespace.map(str::to_string), name: "*".into() };
        let list = api.list(&ListParams::default()).await.map_err(|e| map_err("list", &scope, None, e))?;
        Ok(list.items.into_iter().map(|o| tidy(o, kind)).collect())
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = ObjectKey::of(obj)?;
        let api = self.api(&key.kind, key.namespace.as_deref()).await?;
        let pp = PostParams { field_manager: Some(self.field_manager.clone()), ..Default::default() };
        let created = api.create(&pp, obj).await.map_err(|e| map_err("create", &key, None, e))?;
        info!(%key, "created");
        Ok(tidy(created, &key.kind))
    }

    async fn patch(&self, key: &ObjectKey, resource_version: &str, patch: &Json) -> Result<DynamicObject> {
        let api = self.api(&key.kind, key.namespace.as_deref()).await?;
        let body = with_resource_version(patch, resource_version);
        let out = api
            .patch(&key.name, &self.patch_params(), &Patch::Merge(&body))
            .await
            .map_err(|e| map_err("patch", key, Some(resource_version), e))?;
        debug!(%key, rv = ?out.metadata.resource_version, "patched");
        Ok(tidy(out, &key.kind))
    }

    async fn patch_status(&self, key: &ObjectKey, resource_version: &str, status: &Json) -> Result<DynamicObject> {
        let api = self.api(&key.kind, key.namespace.as_deref()).await?;
        let body = serde_json::json!({ "metadata": { "resourceVersion": resource_version }, "status": status });
        let out = api
            .patch_status(&key.name, &self.patch_params(), &Patch::Merge(&body))
            .await
            .map_err(|e| map_err("patch_status", key, Some(resource_version), e))?;
        Ok(tidy(out, &key.kind))
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        let api = self.api(&key.kind, key.namespace.as_deref()).await?;
        // Background propagation: the garbage collector removes dependents.
        api.delete(&key.name, &DeleteParams::background()).await.map_err(|e| map_err("delete", key, None, e))?;
        info!(%key, "deleted");
        Ok(())
    }
}
