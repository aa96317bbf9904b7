//! Templates for the dependent objects: fixed images, ports and labels.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, KeyToPath, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use keel_core::{Error, Result};
use kube::core::DynamicObject;
use serde::Serialize;

pub const HOMESERVER_IMAGE: &str = "docker.io/matrixdotorg/synapse:v1.98.0";
pub const HOMESERVER_PORT: i32 = 8008;
pub const HEISENBRIDGE_IMAGE: &str = "docker.io/hif1/heisenbridge:1.14";
pub const HEISENBRIDGE_PORT: i32 = 9898;
pub const MAUTRIX_SIGNAL_IMAGE: &str = "dock.mau.dev/mautrix/signal:v0.4.3";
pub const MAUTRIX_SIGNAL_PORT: i32 = 29328;
pub const SIGNALD_IMAGE: &str = "docker.io/signald/signald:0.23.0";
pub const SIGNALD_MOUNT: &str = "/signald";
pub const SIGNALD_STORAGE: &str = "1Gi";
pub const CONFIG_HASH_ANNOTATION: &str = "keel.dev/config-hash";

/// Backing of an extra volume mounted into a workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountSource {
    /// A single key of a ConfigMap, projected as a file of the same name.
    ConfigMapKey { config_map: String, key: String },
    Claim(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub volume: String,
    pub path: String,
    pub source: MountSource,
}

/// Parameters of a single-container workload.
#[derive(Debug, Clone)]
pub struct Workload<'a> {
    pub name: &'a str,
    pub namespace: &'a str,
    pub labels: BTreeMap<String, String>,
    pub image: &'a str,
    pub port: i32,
    pub config_map: &'a str,
    pub config_mount: &'a str,
    pub config_hash: &'a str,
    pub mounts: Vec<Mount>,
}

pub fn labels(app: &str, instance: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("app".to_string(), app.to_string()), ("keel.dev/instance".to_string(), instance.to_string())])
}

fn meta(name: &str, namespace: &str, labels: &BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta { name: Some(name.to_string()), namespace: Some(namespace.to_string()), labels: Some(labels.clone()), ..Default::default() }
}

fn to_dynamic<K: Serialize>(obj: &K) -> Result<DynamicObject> {
    let v = serde_json::to_value(obj).map_err(|e| Error::malformed("template", e))?;
    serde_json::from_value(v).map_err(|e| Error::malformed("template", e))
}

/// ConfigMap holding `files` (file name to content).
pub fn config_map(name: &str, namespace: &str, labels: &BTreeMap<String, String>, files: BTreeMap<String, String>) -> Result<DynamicObject> {
    to_dynamic(&ConfigMap { metadata: meta(name, namespace, labels), data: Some(files), ..Default::default() })
}

pub fn service(name: &str, namespace: &str, labels: &BTreeMap<String, String>, port_name: &str, port: i32) -> Result<DynamicObject> {
    to_dynamic(&Service {
        metadata: meta(name, namespace, labels),
        spec: Some(ServiceSpec {
            ports: Some(vec![ServicePort {
                name: Some(port_name.to_string()),
                protocol: Some("TCP".to_string()),
                port,
                target_port: Some(IntOrString::Int(port)),
                ..Default::default()
            }]),
            selector: Some(labels.clone()),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn volume_of(m: &Mount) -> Volume {
    match &m.source {
        MountSource::ConfigMapKey { config_map, key } => Volume {
            name: m.volume.clone(),
            config_map: Some(ConfigMapVolumeSource {
                name: Some(config_map.clone()),
                items: Some(vec![KeyToPath { key: key.clone(), path: key.clone(), ..Default::default() }]),
                ..Default::default()
            }),
            ..Default::default()
        },
        MountSource::Claim(claim) => Volume {
            name: m.volume.clone(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource { claim_name: claim.clone(), ..Default::default() }),
            ..Default::default()
        },
    }
}

fn single_replica(name: &str, namespace: &str, labels: &BTreeMap<String, String>, pod_meta: ObjectMeta, pod: PodSpec) -> Result<DynamicObject> {
    to_dynamic(&Deployment {
        metadata: meta(name, namespace, labels),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector { match_labels: Some(labels.clone()), ..Default::default() },
            template: PodTemplateSpec { metadata: Some(pod_meta), spec: Some(pod) },
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Deployment running `w.image` with its config mounted at `w.config_mount`, plus `w.mounts`.
pub fn deployment(w: &Workload<'_>) -> Result<DynamicObject> {
    let pod_meta = ObjectMeta {
        labels: Some(w.labels.clone()),
        annotations: Some(BTreeMap::from([(CONFIG_HASH_ANNOTATION.to_string(), w.config_hash.to_string())])),
        ..Default::default()
    };
    let mut volumes = vec![Volume {
        name: "config".to_string(),
        config_map: Some(ConfigMapVolumeSource { name: Some(w.config_map.to_string()), ..Default::default() }),
        ..Default::default()
    }];
    let mut mounts = vec![VolumeMount { name: "config".to_string(), mount_path: w.config_mount.to_string(), ..Default::default() }];
    for m in w.mounts.iter() {
        volumes.push(volume_of(m));
        mounts.push(VolumeMount { name: m.volume.clone(), mount_path: m.path.clone(), ..Default::default() });
    }
    let pod = PodSpec {
        containers: vec![Container {
            name: w.name.to_string(),
            image: Some(w.image.to_string()),
            ports: Some(vec![ContainerPort { container_port: w.port, ..Default::default() }]),
            volume_mounts: Some(mounts),
            ..Default::default()
        }],
        volumes: Some(volumes),
        ..Default::default()
    };
    single_replica(w.name, w.namespace, &w.labels, pod_meta, pod)
}

/// ReadWriteOnce claim of `storage`.
pub fn persistent_volume_claim(name: &str, namespace: &str, labels: &BTreeMap<String, String>, storage: &str) -> Result<DynamicObject> {
    to_dynamic(&PersistentVolumeClaim {
        metadata: meta(name, namespace, labels),
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([("storage".to_string(), Quantity(storage.to_string()))])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// signald daemon with its state on the claim `claim`, mounted at [`SIGNALD_MOUNT`].
pub fn signald_deployment(name: &str, namespace: &str, labels: &BTreeMap<String, String>, claim: &str) -> Result<DynamicObject> {
    let m = Mount { volume: "signald".to_string(), path: SIGNALD_MOUNT.to_string(), source: MountSource::Claim(claim.to_string()) };
    let pod = PodSpec {
        containers: vec![Container {
            name: "signald".to_string(),
            image: Some(SIGNALD_IMAGE.to_string()),
            volume_mounts: Some(vec![VolumeMount { name: m.volume.clone(), mount_path: m.path.clone(), ..Default::default() }]),
            ..Default::default()
        }],
        volumes: Some(vec![volume_of(&m)]),
        ..Default::default()
    };
    let pod_meta = ObjectMeta { labels: Some(labels.clone()), ..Default::default() };
    single_replica(name, namespace, labels, pod_meta, pod)
}

/// 64-bit FNV-1a over the config payload, hex encoded.
pub fn content_hash(content: &str) -> String {
    let mut h: u64 = 0xcbf29ce484222325;
    for b in content.as_bytes() {
        h ^= *b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    format!("{h:016x}")
}
