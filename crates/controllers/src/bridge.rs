//! Bridge reconciler. Bridges attach to a homeserver without an ownership edge; every
//! pass wakes the homeserver so it picks up the bridge's registration.
//!
//! Each bridge publishes its app-service registration as `registration.yaml` in its own
//! ConfigMap. The homeserver mounts that key at [`registration_dir`] and lists
//! [`registration_path`] in its config. Signal bridges additionally run a signald
//! daemon on a claim shared with the bridge container.

use std::collections::BTreeMap;
use std::sync::Arc;

use keel_core::{Error, Kind, ObjectKey, ReconcileRequest, Result, Signal, StatusRecord};
use keel_pipeline::{Reconciler, Steps};
use kube::core::DynamicObject;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, warn};

use crate::catalog::{self, Mount, MountSource, Workload};
use crate::homeserver::config_hash;
use crate::{
    bridge_kind, config, config_map_kind, deployment_kind, homeserver_kind, persistent_volume_claim_kind, service_fqdn, service_kind, spec_of,
    step, Context, NamespacedRef,
};

pub const CONFIG_FILE: &str = "bridge.yaml";
pub const REGISTRATION_FILE: &str = "registration.yaml";
const CONFIG_MOUNT: &str = "/data";

/// Which bridge implementation runs.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Protocol {
    /// IRC through heisenbridge.
    #[default]
    Irc,
    /// Signal through mautrix-signal and a signald daemon.
    Signal,
}

impl Protocol {
    pub fn app(self) -> &'static str {
        match self {
            Protocol::Irc => "heisenbridge",
            Protocol::Signal => "mautrix-signal",
        }
    }

    pub fn image(self) -> &'static str {
        match self {
            Protocol::Irc => catalog::HEISENBRIDGE_IMAGE,
            Protocol::Signal => catalog::MAUTRIX_SIGNAL_IMAGE,
        }
    }

    pub fn port(self) -> i32 {
        match self {
            Protocol::Irc => catalog::HEISENBRIDGE_PORT,
            Protocol::Signal => catalog::MAUTRIX_SIGNAL_PORT,
        }
    }

    fn sender_localpart(self) -> &'static str {
        match self {
            Protocol::Irc => "heisenbridge",
            Protocol::Signal => "signalbot",
        }
    }

    fn user_prefix(self) -> &'static str {
        match self {
            Protocol::Irc => "irc",
            Protocol::Signal => "signal",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BridgeSpec {
    pub homeserver: NamespacedRef,
    #[serde(default)]
    pub protocol: Protocol,
    /// ConfigMap holding a user-supplied `bridge.yaml`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map: Option<NamespacedRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// Directory the homeserver mounts this bridge's registration into.
pub fn registration_dir(namespace: &str, name: &str) -> String { format!("/bridges/{namespace}/{name}") }

/// Where the homeserver expects this bridge's app-service registration file.
pub fn registration_path(namespace: &str, name: &str) -> String { format!("{}/{REGISTRATION_FILE}", registration_dir(namespace, name)) }

/// Volume name for a bridge registration inside the homeserver pod. Bounded length.
pub fn registration_volume(name: &str) -> String { format!("reg-{}", catalog::content_hash(name)) }

/// Name shared by the bridge's ConfigMap, Service and Deployment.
pub fn resource_name(bridge: &str) -> String { format!("{bridge}-bridge") }

/// Name of the signald claim and Deployment of a Signal bridge.
pub fn signald_name(bridge: &str) -> String { format!("{bridge}-signald") }

/// Mount of a bridge's registration into its homeserver's pod.
pub fn registration_mount(namespace: &str, bridge: &str) -> Mount {
    Mount {
        volume: registration_volume(bridge),
        path: registration_dir(namespace, bridge),
        source: MountSource::ConfigMapKey { config_map: resource_name(bridge), key: REGISTRATION_FILE.to_string() },
    }
}

/// The homeserver a bridge object points at, if its spec decodes. Works on deleted
/// objects too, so a bridge's removal can be routed to its homeserver.
pub fn homeserver_of(bridge: &DynamicObject) -> Option<ObjectKey> {
    let spec = spec_of::<BridgeSpec>(bridge).ok()?;
    Some(homeserver_key(bridge, &spec))
}

pub struct BridgeReconciler {
    kind: Kind,
    ctx: Arc<Context>,
}

impl BridgeReconciler {
    pub fn new(ctx: Arc<Context>) -> Self { Self { kind: bridge_kind(), ctx } }
}

impl Reconciler for BridgeReconciler {
    fn kind(&self) -> &Kind { &self.kind }

    fn plan(&self, resource: &DynamicObject) -> Result<Steps> {
        let spec: BridgeSpec = spec_of(resource)?;
        let mut steps: Steps = vec![step(&self.ctx, "wake-homeserver", wake_homeserver)];
        match spec.config_map {
            Some(r) if !r.name.is_empty() => steps.push(step(&self.ctx, "supplied-config", supplied_config)),
            _ => steps.push(step(&self.ctx, "default-config", default_config)),
        }
        if spec.protocol == Protocol::Signal {
            steps.push(step(&self.ctx, "signald-pvc", signald_pvc));
            steps.push(step(&self.ctx, "signald-deployment", signald_deployment));
        }
        steps.push(step(&self.ctx, "service", service));
        steps.push(step(&self.ctx, "deployment", deployment));
        steps.push(step(&self.ctx, "status", ready));
        Ok(steps)
    }
}

fn homeserver_key(bridge: &DynamicObject, spec: &BridgeSpec) -> ObjectKey {
    spec.homeserver.key(homeserver_kind(), bridge.metadata.namespace.as_deref())
}

fn own_service_url(name: &str, namespace: &str, protocol: Protocol) -> String {
    format!("http://{}:{}", service_fqdn(&resource_name(name), namespace), protocol.port())
}

async fn wake_homeserver(ctx: Arc<Context>, req: ReconcileRequest) -> Result<Signal> {
    let b = ctx.latest(&req).await?;
    let spec: BridgeSpec = spec_of(&b)?;
    ctx.trigger.request_reconcile(&homeserver_key(&b, &spec)).await?;
    Ok(Signal::Continue)
}

fn owned_settings(b: &DynamicObject, spec: &BridgeSpec) -> Json {
    let hs = homeserver_key(b, spec);
    let url = format!("http://{}:{}", service_fqdn(&hs.name, hs.namespace.as_deref().unwrap_or_default()), catalog::HOMESERVER_PORT);
    let mut settings = serde_json::json!({ "homeserver": { "url": url }, "listen_port": spec.protocol.port() });
    if spec.protocol == Protocol::Signal {
        settings["signal"] = serde_json::json!({ "socket_path": format!("{}/signald.sock", catalog::SIGNALD_MOUNT) });
    }
    settings
}

/// Tokens already published in the bridge's registration, so every pass renders the same file.
async fn published_tokens(ctx: &Context, cm_key: &ObjectKey) -> Result<Option<(String, String)>> {
    let Some(cm) = ctx.store.get(cm_key).await? else { return Ok(None) };
    let Some(yaml) = cm.data.get("data").and_then(|d| d.get(REGISTRATION_FILE)).and_then(Json::as_str) else { return Ok(None) };
    let Ok(reg) = config::parse(yaml, REGISTRATION_FILE) else {
        debug!(%cm_key, "unreadable registration; issuing new tokens");
        return Ok(None);
    };
    match (reg["as_token"].as_str(), reg["hs_token"].as_str()) {
        (Some(a), Some(h)) if !a.is_empty() && !h.is_empty() => Ok(Some((a.to_string(), h.to_string()))),
        _ => Ok(None),
    }
}

async fn registration(ctx: &Context, b: &DynamicObject, spec: &BridgeSpec, cm_key: &ObjectKey) -> Result<Json> {
    let name = b.metadata.name.as_deref().unwrap_or_default();
    let ns = b.metadata.namespace.as_deref().unwrap_or_default();
    let (as_token, hs_token) = match published_tokens(ctx, cm_key).await? {
        Some(t) => t,
        None => (uuid::Uuid::new_v4().simple().to_string(), uuid::Uuid::new_v4().simple().to_string()),
    };
    Ok(serde_json::json!({
        "id": format!("{ns}-{name}"),
        "url": own_service_url(name, ns, spec.protocol),
        "as_token": as_token,
        "hs_token": hs_token,
        "sender_localpart": spec.protocol.sender_localpart(),
        "rate_limited": false,
        "namespaces": {
            "users": [{ "exclusive": true, "regex": format!("@{}_.*", spec.protocol.user_prefix()) }],
            "aliases": [],
            "rooms": []
        }
    }))
}

async fn converge_config(ctx: &Context, b: &DynamicObject, spec: &BridgeSpec, mut doc: Json) -> Result<Signal> {
    config::overlay(&mut doc, &owned_settings(b, spec));
    let bname = b.metadata.name.as_deref().unwrap_or_default();
    let name = resource_name(bname);
    let ns = b.metadata.namespace.as_deref().unwrap_or_default();
    let cm_key = ObjectKey::namespaced(config_map_kind(), ns, &name);
    let reg = registration(ctx, b, spec, &cm_key).await?;
    let files = BTreeMap::from([(CONFIG_FILE.to_string(), config::render(&doc)?), (REGISTRATION_FILE.to_string(), config::render(&reg)?)]);
    let desired = catalog::config_map(&name, ns, &catalog::labels(spec.protocol.app(), bname), files)?;
    ctx.converger.converge(desired, &config_map_kind(), b).await?;
    Ok(Signal::Continue)
}

async fn default_config(ctx: Arc<Context>, req: ReconcileRequest) -> Result<Signal> {
    let b = ctx.latest(&req).await?;
    let spec: BridgeSpec = spec_of(&b)?;
    let doc = serde_json::json!({
        "id": format!("{}-{}", req.namespace().unwrap_or_default(), req.name()),
        "listen_address": "0.0.0.0",
    });
    converge_config(&ctx, &b, &spec, doc).await
}

async fn supplied_config(ctx: Arc<Context>, req: ReconcileRequest) -> Result<Signal> {
    let b = ctx.latest(&req).await?;
    let spec: BridgeSpec = spec_of(&b)?;
    let Some(input) = spec.config_map.as_ref().filter(|r| !r.name.is_empty()).map(|r| r.key(config_map_kind(), req.namespace())) else {
        return Ok(Signal::Requeue);
    };
    let yaml = match ctx.store.get(&input).await? {
        Some(cm) => cm.data.get("data").and_then(|d| d.get(CONFIG_FILE)).and_then(Json::as_str).map(str::to_string),
        None => {
            warn!(%input, "input ConfigMap missing");
            ctx.status.set_failed(&req.key, &format!("ConfigMap {input} not found")).await?;
            return Ok(Signal::RequeueWithError(Error::NotFound(input)));
        }
    };
    let parsed = match yaml {
        Some(y) => config::parse(&y, CONFIG_FILE),
        None => Err(Error::malformed(input.to_string(), format!("missing {CONFIG_FILE}"))),
    };
    match parsed {
        Ok(doc) => converge_config(&ctx, &b, &spec, doc).await,
        Err(e) => {
            ctx.status.set_failed(&req.key, &e.to_string()).await?;
            Ok(Signal::RequeueWithError(e))
        }
    }
}

async fn signald_pvc(ctx: Arc<Context>, req: ReconcileRequest) -> Result<Signal> {
    let b = ctx.latest(&req).await?;
    let name = signald_name(req.name());
    let desired = catalog::persistent_volume_claim(&name, req.namespace().unwrap_or_default(), &catalog::labels("signald", req.name()), catalog::SIGNALD_STORAGE)?;
    ctx.converger.converge(desired, &persistent_volume_claim_kind(), &b).await?;
    Ok(Signal::Continue)
}

async fn signald_deployment(ctx: Arc<Context>, req: ReconcileRequest) -> Result<Signal> {
    let b = ctx.latest(&req).await?;
    let name = signald_name(req.name());
    let desired = catalog::signald_deployment(&name, req.namespace().unwrap_or_default(), &catalog::labels("signald", req.name()), &name)?;
    ctx.converger.converge(desired, &deployment_kind(), &b).await?;
    Ok(Signal::Continue)
}

async fn service(ctx: Arc<Context>, req: ReconcileRequest) -> Result<Signal> {
    let b = ctx.latest(&req).await?;
    let spec: BridgeSpec = spec_of(&b)?;
    let name = resource_name(req.name());
    let labels = catalog::labels(spec.protocol.app(), req.name());
    let desired = catalog::service(&name, req.namespace().unwrap_or_default(), &labels, "bridge", spec.protocol.port())?;
    ctx.converger.converge(desired, &service_kind(), &b).await?;
    Ok(Signal::Continue)
}

async fn deployment(ctx: Arc<Context>, req: ReconcileRequest) -> Result<Signal> {
    let b = ctx.latest(&req).await?;
    let spec: BridgeSpec = spec_of(&b)?;
    let name = resource_name(req.name());
    let cm_key = ObjectKey { kind: config_map_kind(), namespace: req.key.namespace.clone(), name: name.clone() };
    let Some(hash) = config_hash(&ctx, &cm_key, &[CONFIG_FILE, REGISTRATION_FILE]).await? else {
        return Ok(Signal::Requeue);
    };
    let mounts = match spec.protocol {
        Protocol::Irc => Vec::new(),
        Protocol::Signal => vec![Mount {
            volume: "signald".to_string(),
            path: catalog::SIGNALD_MOUNT.to_string(),
            source: MountSource::Claim(signald_name(req.name())),
        }],
    };
    let desired = catalog::deployment(&Workload {
        name: &name,
        namespace: req.namespace().unwrap_or_default(),
        labels: catalog::labels(spec.protocol.app(), req.name()),
        image: spec.image.as_deref().unwrap_or(spec.protocol.image()),
        port: spec.protocol.port(),
        config_map: &name,
        config_mount: CONFIG_MOUNT,
        config_hash: &hash,
        mounts,
    })?;
    ctx.converger.converge(desired, &deployment_kind(), &b).await?;
    Ok(Signal::Continue)
}

async fn ready(ctx: Arc<Context>, req: ReconcileRequest) -> Result<Signal> {
    ctx.status.update_status(&req.key, &StatusRecord::ready()).await?;
    Ok(Signal::Continue)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bridge_spec_decodes_camel_case() {
        let obj: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "matrix.keel.dev/v1alpha1", "kind": "Bridge",
            "metadata": { "name": "irc", "namespace": "chat" },
            "spec": { "homeserver": { "name": "hs" }, "configMap": { "name": "irc-cfg", "namespace": "cfg" } }
        })).unwrap();
        let spec: BridgeSpec = spec_of(&obj).unwrap();
        assert_eq!(spec.protocol, Protocol::Irc);
        assert_eq!(homeserver_key(&obj, &spec), ObjectKey::namespaced(homeserver_kind(), "chat", "hs"));
        assert_eq!(homeserver_of(&obj), Some(ObjectKey::namespaced(homeserver_kind(), "chat", "hs")));
        assert_eq!(spec.config_map.unwrap().namespace.as_deref(), Some("cfg"));
        assert_eq!(owned_settings(&obj, &BridgeSpec { homeserver: NamespacedRef { name: "hs".into(), namespace: None }, ..Default::default() })["homeserver"]["url"],
            "http://hs.chat.svc.cluster.local:8008");
    }

    #[test]
    fn signal_protocol_points_at_signald_socket() {
        let obj: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "matrix.keel.dev/v1alpha1", "kind": "Bridge",
            "metadata": { "name": "sig", "namespace": "chat" },
            "spec": { "homeserver": { "name": "hs" }, "protocol": "signal" }
        })).unwrap();
        let spec: BridgeSpec = spec_of(&obj).unwrap();
        assert_eq!(spec.protocol, Protocol::Signal);
        let s = owned_settings(&obj, &spec);
        assert_eq!(s["signal"]["socket_path"], "/signald/signald.sock");
        assert_eq!(s["listen_port"], catalog::MAUTRIX_SIGNAL_PORT);
    }

    #[test]
    fn registration_mount_matches_listed_path() {
        let m = registration_mount("chat", "irc");
        assert_eq!(format!("{}/{}", m.path, REGISTRATION_FILE), registration_path("chat", "irc"));
        assert_eq!(m.source, MountSource::ConfigMapKey { config_map: "irc-bridge".into(), key: REGISTRATION_FILE.into() });
        assert!(m.volume.len() <= 63);
    }
}
