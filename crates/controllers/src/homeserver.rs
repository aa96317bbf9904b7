//! Homeserver reconciler: config, Service and Deployment owned by the Homeserver.
//!
//! The config depends on which bridges reference this homeserver, so a new bridge
//! raises `needsReconcile` here; the final status step clears it again.

use std::collections::BTreeMap;
use std::sync::Arc;

use keel_core::{Error, Kind, ObjectKey, ReconcileRequest, Result, Signal, StatusRecord};
use keel_pipeline::{Reconciler, Steps};
use kube::core::DynamicObject;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, warn};

use crate::bridge::{homeserver_of, registration_mount, registration_path};
use crate::catalog::{self, Workload};
use crate::{bridge_kind, config, config_map_kind, deployment_kind, homeserver_kind, service_kind, spec_of, step, Context, NamespacedRef};

pub const CONFIG_FILE: &str = "homeserver.yaml";
const CONFIG_MOUNT: &str = "/data";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HomeserverSpec {
    pub server_name: String,
    /// ConfigMap holding a user-supplied `homeserver.yaml`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map: Option<NamespacedRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// Where the config file comes from, decided once per pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Supplied(ObjectKey),
    Synthesized,
}

impl ConfigSource {
    pub fn of(resource: &DynamicObject, spec: &HomeserverSpec) -> Self {
        match &spec.config_map {
            Some(r) if !r.name.is_empty() => ConfigSource::Supplied(r.key(config_map_kind(), resource.metadata.namespace.as_deref())),
            _ => ConfigSource::Synthesized,
        }
    }
}

pub struct HomeserverReconciler {
    kind: Kind,
    ctx: Arc<Context>,
}

impl HomeserverReconciler {
    pub fn new(ctx: Arc<Context>) -> Self { Self { kind: homeserver_kind(), ctx } }
}

impl Reconciler for HomeserverReconciler {
    fn kind(&self) -> &Kind { &self.kind }

    fn plan(&self, resource: &DynamicObject) -> Result<Steps> {
        let spec: HomeserverSpec = spec_of(resource)?;
        let mut steps: Steps = Vec::with_capacity(4);
        match ConfigSource::of(resource, &spec) {
            ConfigSource::Supplied(_) => steps.push(step(&self.ctx, "supplied-config", supplied_config)),
            ConfigSource::Synthesized => steps.push(step(&self.ctx, "default-config", default_config)),
        }
        steps.push(step(&self.ctx, "service", service));
        steps.push(step(&self.ctx, "deployment", deployment));
        steps.push(step(&self.ctx, "status", ready));
        Ok(steps)
    }
}

/// Bridges in the homeserver's namespace whose spec points at it, sorted by name.
///
/// Registrations are mounted from the bridges' ConfigMaps, which a pod can only reference
/// in its own namespace; bridges elsewhere are skipped.
async fn attached_bridges(ctx: &Context, hs: &DynamicObject) -> Result<Vec<String>> {
    let hs_key = ObjectKey::of(hs)?;
    let mut names = Vec::new();
    for b in ctx.store.list(&bridge_kind(), None).await? {
        let Some(target) = homeserver_of(&b) else {
            debug!(bridge = ?b.metadata.name, "skipping bridge with unreadable spec");
            continue;
        };
        if target != hs_key {
            continue;
        }
        if b.metadata.namespace != hs.metadata.namespace {
            warn!(bridge = ?b.metadata.name, bridge_ns = ?b.metadata.namespace, "bridge in another namespace cannot be mounted; skipping");
            continue;
        }
        names.extend(b.metadata.name.clone());
    }
    names.sort();
    Ok(names)
}

/// Settings this controller owns inside `homeserver.yaml`.
async fn owned_settings(ctx: &Context, hs: &DynamicObject, spec: &HomeserverSpec) -> Result<Json> {
    let ns = hs.metadata.namespace.as_deref().unwrap_or_default();
    let files: Vec<String> = attached_bridges(ctx, hs).await?.iter().map(|b| registration_path(ns, b)).collect();
    Ok(serde_json::json!({ "server_name": spec.server_name, "app_service_config_files": files }))
}

fn default_document(spec: &HomeserverSpec) -> Json {
    serde_json::json!({
        "server_name": spec.server_name,
        "report_stats": false,
        "pid_file": format!("{CONFIG_MOUNT}/homeserver.pid"),
        "media_store_path": format!("{CONFIG_MOUNT}/media_store"),
        "listeners": [{
            "port": catalog::HOMESERVER_PORT,
            "tls": false,
            "type": "http",
            "x_forwarded": true,
            "resources": [{ "names": ["client", "federation"], "compress": false }]
        }],
        "database": { "name": "sqlite3", "args": { "database": format!("{CONFIG_MOUNT}/homeserver.db") } }
    })
}

async fn converge_config(ctx: &Context, hs: &DynamicObject, mut doc: Json, spec: &HomeserverSpec) -> Result<Signal> {
    config::overlay(&mut doc, &owned_settings(ctx, hs, spec).await?);
    let name = hs.metadata.name.as_deref().unwrap_or_default();
    let ns = hs.metadata.namespace.as_deref().unwrap_or_default();
    let files = BTreeMap::from([(CONFIG_FILE.to_string(), config::render(&doc)?)]);
    let desired = catalog::config_map(name, ns, &catalog::labels("homeserver", name), files)?;
    ctx.converger.converge(desired, &config_map_kind(), hs).await?;
    Ok(Signal::Continue)
}

async fn default_config(ctx: Arc<Context>, req: ReconcileRequest) -> Result<Signal> {
    let hs = ctx.latest(&req).await?;
    let spec: HomeserverSpec = spec_of(&hs)?;
    converge_config(&ctx, &hs, default_document(&spec), &spec).await
}

async fn supplied_config(ctx: Arc<Context>, req: ReconcileRequest) -> Result<Signal> {
    let hs = ctx.latest(&req).await?;
    let spec: HomeserverSpec = spec_of(&hs)?;
    let ConfigSource::Supplied(input) = ConfigSource::of(&hs, &spec) else {
        // Spec changed since planning; start over.
        return Ok(Signal::Requeue);
    };
    let Some(cm) = ctx.store.get(&input).await? else {
        let reason = format!("ConfigMap {} not found", input);
        warn!(%input, "input ConfigMap missing");
        ctx.status.set_failed(&req.key, &reason).await?;
        return Ok(Signal::RequeueWithError(Error::NotFound(input)));
    };
    let Some(yaml) = cm.data.get("data").and_then(|d| d.get(CONFIG_FILE)).and_then(Json::as_str) else {
        let reason = format!("ConfigMap {} has no {}", input, CONFIG_FILE);
        ctx.status.set_failed(&req.key, &reason).await?;
        return Ok(Signal::RequeueWithError(Error::malformed(input.to_string(), reason)));
    };
    let doc = match config::parse(yaml, CONFIG_FILE) {
        Ok(d) => d,
        Err(e) => {
            ctx.status.set_failed(&req.key, &e.to_string()).await?;
            return Ok(Signal::RequeueWithError(e));
        }
    };
    converge_config(&ctx, &hs, doc, &spec).await
}

async fn service(ctx: Arc<Context>, req: ReconcileRequest) -> Result<Signal> {
    let hs = ctx.latest(&req).await?;
    let desired = catalog::service(req.name(), req.namespace().unwrap_or_default(), &catalog::labels("homeserver", req.name()), "http", catalog::HOMESERVER_PORT)?;
    ctx.converger.converge(desired, &service_kind(), &hs).await?;
    Ok(Signal::Continue)
}

async fn deployment(ctx: Arc<Context>, req: ReconcileRequest) -> Result<Signal> {
    let hs = ctx.latest(&req).await?;
    let spec: HomeserverSpec = spec_of(&hs)?;
    let Some(hash) = config_hash(&ctx, &req.key.with_kind(config_map_kind()), &[CONFIG_FILE]).await? else {
        return Ok(Signal::Requeue);
    };
    let ns = req.namespace().unwrap_or_default();
    let mounts = attached_bridges(&ctx, &hs).await?.iter().map(|b| registration_mount(ns, b)).collect();
    let desired = catalog::deployment(&Workload {
        name: req.name(),
        namespace: req.namespace().unwrap_or_default(),
        labels: catalog::labels("homeserver", req.name()),
        image: spec.image.as_deref().unwrap_or(catalog::HOMESERVER_IMAGE),
        port: catalog::HOMESERVER_PORT,
        config_map: req.name(),
        config_mount: CONFIG_MOUNT,
        config_hash: &hash,
        mounts,
    })?;
    ctx.converger.converge(desired, &deployment_kind(), &hs).await?;
    Ok(Signal::Continue)
}

/// Hash of the live config payload (`files`, in order); `None` while the ConfigMap does not exist yet.
pub(crate) async fn config_hash(ctx: &Context, key: &ObjectKey, files: &[&str]) -> Result<Option<String>> {
    let Some(cm) = ctx.store.get(key).await? else { return Ok(None) };
    let data = cm.data.get("data");
    let content: Vec<&str> = files.iter().map(|f| data.and_then(|d| d.get(*f)).and_then(Json::as_str).unwrap_or_default()).collect();
    Ok(Some(catalog::content_hash(&content.join("\n---\n"))))
}

/// Record success and consume the trigger flag.
async fn ready(ctx: Arc<Context>, req: ReconcileRequest) -> Result<Signal> {
    ctx.status.update_status(&req.key, &StatusRecord::ready()).await?;
    Ok(Signal::Continue)
}
