#![forbid(unsafe_code)]

use keel_core::{Error, Kind, ObjectKey, ObjectStore};
use keel_store::{Change, MemoryStore};
use kube::core::DynamicObject;

fn cm(name: &str, owner: Option<(&str, &str, &str)>) -> DynamicObject {
    let mut v = serde_json::json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": { "name": name, "namespace": "ns" },
        "data": { "k": "v" }
    });
    if let Some((kind, n, uid)) = owner {
        v["metadata"]["ownerReferences"] = serde_json::json!([{
            "apiVersion": "matrix.keel.dev/v1alpha1", "kind": kind, "name": n, "uid": uid, "controller": true
        }]);
    }
    serde_json::from_value(v).unwrap()
}

fn key(name: &str) -> ObjectKey { ObjectKey::namespaced(Kind::new("", "v1", "ConfigMap"), "ns", name) }

#[tokio::test]
async fn stale_resource_version_conflicts() {
    let store = MemoryStore::new();
    let created = store.create(&cm("a", None)).await.unwrap();
    let rv = created.metadata.resource_version.clone().unwrap();
    store.patch(&key("a"), &rv, &serde_json::json!({ "data": { "k": "w" } })).await.unwrap();
    let err = store.patch(&key("a"), &rv, &serde_json::json!({ "data": { "k": "x" } })).await.unwrap_err();
    assert!(matches!(err, Error::Conflict { .. }), "err={err}");
    let live = store.get(&key("a")).await.unwrap().unwrap();
    assert_eq!(live.data["data"]["k"], "w");
}

#[tokio::test]
async fn create_ignores_status_and_rejects_duplicates() {
    let store = MemoryStore::new();
    let mut obj = cm("a", None);
    obj.data["status"] = serde_json::json!({ "state": "READY" });
    let created = store.create(&obj).await.unwrap();
    assert!(created.data.get("status").is_none());
    assert!(created.metadata.uid.is_some());
    assert!(matches!(store.create(&obj).await, Err(Error::AlreadyExists(_))));
}

#[tokio::test]
async fn delete_cascades_through_controlling_owners() {
    let store = MemoryStore::new();
    let root = store.create(&cm("root", None)).await.unwrap();
    let root_uid = root.metadata.uid.clone().unwrap();
    let child = store.create(&cm("child", Some(("ConfigMap", "root", &root_uid)))).await.unwrap();
    let child_uid = child.metadata.uid.clone().unwrap();
    store.create(&cm("grandchild", Some(("ConfigMap", "child", &child_uid)))).await.unwrap();
    store.create(&cm("bystander", None)).await.unwrap();

    store.delete(&key("root")).await.unwrap();

    assert!(store.get(&key("child")).await.unwrap().is_none());
    assert!(store.get(&key("grandchild")).await.unwrap().is_none());
    assert!(store.get(&key("bystander")).await.unwrap().is_some());
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn writes_notify_object_and_controlling_owner() {
    let store = MemoryStore::new();
    let mut rx = store.subscribe();
    store.create(&cm("child", Some(("Homeserver", "hs", "u-1")))).await.unwrap();
    let mut seen = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
    seen.sort_by(|a, b| a.key.cmp(&b.key));
    assert_eq!(seen[0].key, key("child"));
    assert_eq!(seen[1].key.kind, Kind::new("matrix.keel.dev", "v1alpha1", "Homeserver"));
    assert_eq!(seen[1].key.name, "hs");
}

#[tokio::test]
async fn noop_patch_keeps_resource_version() {
    let store = MemoryStore::new();
    let created = store.create(&cm("a", None)).await.unwrap();
    let rv = created.metadata.resource_version.clone().unwrap();
    let same = store.patch(&key("a"), &rv, &serde_json::json!({ "data": { "k": "v" } })).await.unwrap();
    assert_eq!(same.metadata.resource_version.as_deref(), Some(rv.as_str()));
    assert_eq!(store.write_counts().patches, 1);
}

#[tokio::test]
async fn deletions_are_watched_with_the_last_state() {
    let store = MemoryStore::new();
    let owner = store.create(&cm("owner", None)).await.unwrap();
    let uid = owner.metadata.uid.clone().unwrap();
    store.create(&cm("child", Some(("ConfigMap", "owner", &uid)))).await.unwrap();
    let mut rx = store.watch();
    store.delete(&key("owner")).await.unwrap();
    let mut deleted = Vec::new();
    while let Ok(change) = rx.try_recv() {
        match change {
            Change::Deleted(o) => deleted.push((o.metadata.name.clone().unwrap(), o.data["data"]["k"].clone())),
            Change::Applied(o) => panic!("unexpected apply of {:?}", o.metadata.name),
        }
    }
    deleted.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(deleted, vec![("child".to_string(), serde_json::json!("v")), ("owner".to_string(), serde_json::json!("v"))]);
}
