//! Registry record types.
//!
//! These are the JSON shapes the registry scripts read and write through
//! `cjson`; the Rust side round-trips the same documents with serde.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A worker's registry record (`wh` hash entry).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    /// Worker class name.
    pub name: String,

    /// Owning broker; absent while the worker is in the recovery window.
    #[serde(rename = "brokerId", default, skip_serializing_if = "Option::is_none")]
    pub broker_id: Option<String>,

    /// Application attribute bag.
    #[serde(default)]
    pub attributes: WorkerAttributes,

    /// Worker id, filled in by `fetch_for_recovery`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Original creation time in ms, filled in by `fetch_for_recovery`.
    #[serde(rename = "createdAt", default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<f64>,
}

/// Worker attributes: two reserved booleans plus an opaque remainder.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WorkerAttributes {
    /// Static workers use their class name as their id.
    #[serde(rename = "static", default, skip_serializing_if = "is_false")]
    pub is_static: bool,

    /// Recoverable workers survive their broker through salvage/recover.
    #[serde(default, skip_serializing_if = "is_false")]
    pub recoverable: bool,

    /// Application-defined fields, preserved verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_false(value: &bool) -> bool {
    !*value
}

impl WorkerAttributes {
    /// Attributes for a recoverable worker.
    #[must_use]
    pub fn recoverable() -> Self {
        Self {
            recoverable: true,
            ..Self::default()
        }
    }

    /// Attributes for a static worker.
    #[must_use]
    pub fn static_worker() -> Self {
        Self {
            is_static: true,
            ..Self::default()
        }
    }
}

/// A broker's registry record (`bh` hash entry).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerRecord {
    /// Cluster name.
    pub cn: String,
    /// Lifecycle state.
    pub st: BrokerState,
    /// Peer-visible `host:port`.
    pub addr: String,
}

/// Broker record state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrokerState {
    /// Member of both cluster sets, accepting placements.
    #[serde(rename = "active")]
    Active,
    /// Found dead; awaiting salvage.
    #[serde(rename = "invalid")]
    Invalid,
}

impl BrokerState {
    /// Parses the wire string used inside script replies.
    #[must_use]
    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "invalid" => Some(Self::Invalid),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn worker_record_wire_shape() {
        let record = WorkerRecord {
            name: "MyWorker".to_owned(),
            broker_id: Some("br01".to_owned()),
            attributes: WorkerAttributes::recoverable(),
            id: None,
            created_at: None,
        };
        let wire = serde_json::to_value(&record).unwrap();
        assert_eq!(
            wire,
            json!({"name": "MyWorker", "brokerId": "br01", "attributes": {"recoverable": true}})
        );
    }

    #[test]
    fn absent_broker_id_roundtrip() {
        let record: WorkerRecord =
            serde_json::from_str(r#"{"name":"MyWorker","attributes":{}}"#).unwrap();
        assert_eq!(record.broker_id, None);
        let wire = serde_json::to_string(&record).unwrap();
        assert!(!wire.contains("brokerId"));
    }

    #[test]
    fn extra_attributes_preserved() {
        let record: WorkerRecord = serde_json::from_str(
            r#"{"name":"W","attributes":{"recoverable":true,"shard":7,"zone":"eu"}}"#,
        )
        .unwrap();
        assert!(record.attributes.recoverable);
        assert_eq!(record.attributes.extra["shard"], json!(7));
        assert_eq!(record.attributes.extra["zone"], json!("eu"));

        let wire = serde_json::to_value(&record).unwrap();
        assert_eq!(wire["attributes"]["shard"], json!(7));
    }

    #[test]
    fn broker_record_states() {
        let record: BrokerRecord =
            serde_json::from_str(r#"{"cn":"pvp","st":"active","addr":"1.2.3.4:6690"}"#).unwrap();
        assert_eq!(record.st, BrokerState::Active);

        let wire = serde_json::to_value(&BrokerRecord {
            cn: "pvp".to_owned(),
            st: BrokerState::Invalid,
            addr: "1.2.3.4:6690".to_owned(),
        })
        .unwrap();
        assert_eq!(wire["st"], json!("invalid"));
    }

    #[test]
    fn broker_state_from_wire() {
        assert_eq!(BrokerState::from_wire("active"), Some(BrokerState::Active));
        assert_eq!(BrokerState::from_wire("invalid"), Some(BrokerState::Invalid));
        assert_eq!(BrokerState::from_wire("gone"), None);
    }
}
