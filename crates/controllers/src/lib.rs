//! Keel controllers.
//!
//! Two reconcilers built on the step pipeline: [`HomeserverReconciler`] for the core
//! service and [`BridgeReconciler`] for bridges attached to a homeserver. A bridge has
//! no ownership edge to its homeserver; it wakes the homeserver through the
//! `needsReconcile` trigger so the homeserver re-derives its configuration.

#![forbid(unsafe_code)]

use std::future::Future;
use std::sync::Arc;

use keel_apply::{Converger, StatusPatcher, Trigger};
use keel_core::{Error, Kind, ObjectKey, ObjectStore, ReconcileRequest, Result, Signal};
use keel_pipeline::{step_fn, Step};
use kube::core::DynamicObject;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub mod bridge;
pub mod catalog;
pub mod config;
pub mod homeserver;

pub use bridge::{homeserver_of, BridgeReconciler, BridgeSpec, Protocol};
pub use homeserver::{HomeserverReconciler, HomeserverSpec};

pub const GROUP: &str = "matrix.keel.dev";
pub const VERSION: &str = "v1alpha1";

pub fn homeserver_kind() -> Kind { Kind::new(GROUP, VERSION, "Homeserver") }
pub fn bridge_kind() -> Kind { Kind::new(GROUP, VERSION, "Bridge") }
pub fn config_map_kind() -> Kind { Kind::new("", "v1", "ConfigMap") }
pub fn service_kind() -> Kind { Kind::new("", "v1", "Service") }
pub fn deployment_kind() -> Kind { Kind::new("apps", "v1", "Deployment") }
pub fn persistent_volume_claim_kind() -> Kind { Kind::new("", "v1", "PersistentVolumeClaim") }

/// Reference to another object by name; the namespace defaults to the referrer's.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NamespacedRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl NamespacedRef {
    pub fn key(&self, kind: Kind, default_ns: Option<&str>) -> ObjectKey {
        let ns = self.namespace.as_deref().filter(|s| !s.is_empty()).or(default_ns);
        ObjectKey { kind, namespace: ns.map(str::to_string), name: self.name.clone() }
    }
}

/// Cluster-local DNS name of a service.
pub fn service_fqdn(name: &str, namespace: &str) -> String { [name, namespace, "svc", "cluster", "local"].join(".") }

/// Decode `.spec` of a resource.
pub fn spec_of<T: serde::de::DeserializeOwned>(obj: &DynamicObject) -> Result<T> {
    let spec = obj.data.get("spec").cloned().unwrap_or_else(|| serde_json::json!({}));
    serde_json::from_value(spec).map_err(|e| Error::malformed(format!("spec of {}", obj.metadata.name.as_deref().unwrap_or("?")), e))
}

/// Engine components shared by every step of a controller.
pub struct Context {
    pub store: Arc<dyn ObjectStore>,
    pub converger: Converger,
    pub status: StatusPatcher,
    pub trigger: Trigger,
}

impl Context {
    pub fn new(store: Arc<dyn ObjectStore>) -> Arc<Self> {
        let status = StatusPatcher::new(store.clone());
        Arc::new(Self { converger: Converger::new(store.clone()), trigger: Trigger::new(status.clone()), status, store })
    }

    /// Latest copy of the requested resource; steps re-read it rather than trusting the planner's copy.
    pub async fn latest(&self, req: &ReconcileRequest) -> Result<DynamicObject> {
        self.store.get(&req.key).await?.ok_or_else(|| Error::NotFound(req.key.clone()))
    }
}

/// Wrap an async step function into a pipeline step. Errors are classified with
/// [`Signal::for_request`]: the requested resource vanishing halts, everything else requeues.
pub(crate) fn step<F, Fut>(ctx: &Arc<Context>, name: &'static str, f: F) -> Box<dyn Step>
where
    F: Fn(Arc<Context>, ReconcileRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Signal>> + Send + 'static,
{
    let ctx = ctx.clone();
    Box::new(step_fn(name, move |req| {
        let fut = f(ctx.clone(), req.clone());
        async move {
            match fut.await {
                Ok(signal) => signal,
                Err(e) => {
                    if e.is_not_found() {
                        debug!(step = name, error = %e, "not found during step");
                    }
                    Signal::for_request(e, &req.key)
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refs_default_to_referrer_namespace() {
        let r = NamespacedRef { name: "hs".into(), namespace: None };
        assert_eq!(r.key(homeserver_kind(), Some("a")).namespace.as_deref(), Some("a"));
        let r = NamespacedRef { name: "hs".into(), namespace: Some("b".into()) };
        assert_eq!(r.key(homeserver_kind(), Some("a")).namespace.as_deref(), Some("b"));
    }

    #[test]
    fn fqdn_joins_cluster_suffix() {
        assert_eq!(service_fqdn("hs", "ns"), "hs.ns.svc.cluster.local");
    }
}
