//! Status substate persisted under `.status` of every reconciled resource.
//!
//! Status is written for observability and inter-resource signaling only; nothing in
//! this engine derives desired state from it.

use kube::core::DynamicObject;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    #[default]
    Pending,
    Ready,
    Failed,
}

/// Structural equality (`PartialEq`) is the comparison contract used to skip redundant writes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StatusRecord {
    #[serde(default)]
    pub state: State,
    #[serde(default)]
    pub reason: String,
    /// Trigger flag set by other controllers to wake this resource's loop.
    #[serde(default)]
    pub needs_reconcile: bool,
}

impl StatusRecord {
    pub fn ready() -> Self { Self { state: State::Ready, ..Self::default() } }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self { state: State::Failed, reason: reason.into(), needs_reconcile: false }
    }

    /// Read the status of an object; an absent `.status` is the default record.
    pub fn of(obj: &DynamicObject) -> Result<Self> {
        match obj.data.get("status") {
            None | Some(serde_json::Value::Null) => Ok(Self::default()),
            Some(v) => serde_json::from_value(v.clone()).map_err(|e| Error::malformed("status", e)),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "state": self.state,
            "reason": self.reason,
            "needsReconcile": self.needs_reconcile,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_status_is_default() {
        let obj: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "v1", "kind": "X", "metadata": { "name": "a" }
        })).unwrap();
        assert_eq!(StatusRecord::of(&obj).unwrap(), StatusRecord::default());
    }

    #[test]
    fn status_roundtrips_through_object_body() {
        let rec = StatusRecord { state: State::Failed, reason: "boom".into(), needs_reconcile: true };
        let obj: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "v1", "kind": "X", "metadata": { "name": "a" }, "status": rec.to_json()
        })).unwrap();
        assert_eq!(obj.data["status"]["state"], "FAILED");
        assert_eq!(obj.data["status"]["needsReconcile"], true);
        assert_eq!(StatusRecord::of(&obj).unwrap(), rec);
    }
}
