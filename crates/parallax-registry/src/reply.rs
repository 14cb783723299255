//! Typed views over raw script replies.
//!
//! The scripts return tagged arrays; this module converts the raw
//! `redis::Value` trees into per-script enums so callers never pattern
//! match on wire shapes. A reply outside a script's contract is a
//! [`RegistryError::Reply`], surfaced to the initiating caller as an
//! internal fault.

use redis::Value;

use crate::error::{RegistryError, Result};
use crate::records::{BrokerState, WorkerRecord};

/// Reply from `find_or_create`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FindOrCreateReply {
    /// The worker exists (or was just created) on the named broker.
    Found {
        broker_id: String,
        name: String,
        worker_id: String,
    },
    /// Find-only mode and no such worker.
    NotFound,
    /// Transient condition; the caller's backoff driver retries.
    Retry,
}

/// Reply from `find_broker`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FindBrokerReply {
    /// The owning broker, verified reachable.
    Found {
        broker_id: String,
        cluster: String,
        state: Option<BrokerState>,
        addr: String,
    },
    /// No record, under migration, or the owner record was repaired away.
    NotFound,
    /// The owner was found dead and invalidated; retry after salvage.
    Invalidated { broker_id: String },
}

/// Reply from `health_check`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthCheckReply {
    /// Successor healthy, or the ring has only this broker.
    Healthy,
    /// Dead successor invalidated and a salvage broadcast issued.
    SalvageIssued,
    /// An unusable successor entry was pruned from the ring.
    Pruned(String),
}

/// A broker chosen by `pick_broker`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PickedBroker {
    pub broker_id: String,
    pub cluster: String,
    pub addr: String,
}

/// One drain step of the recovery set.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryBatch {
    /// Records this caller won, oldest first.
    pub records: Vec<WorkerRecord>,
    /// Entries still waiting in the recovery set.
    pub remaining: u64,
}

pub(crate) fn parse_unit(value: &Value, script: &str) -> Result<()> {
    match tag(value)? {
        0 => Ok(()),
        code => Err(malformed(script, format!("unexpected code {code}"))),
    }
}

pub(crate) fn parse_pick_broker(value: &Value) -> Result<Option<PickedBroker>> {
    if matches!(value, Value::Nil) {
        return Ok(None);
    }
    let items = as_array(value, "pick_broker")?;
    match items {
        [a, b, c] => Ok(Some(PickedBroker {
            broker_id: as_string(a, "pick_broker")?,
            cluster: as_string(b, "pick_broker")?,
            addr: as_string(c, "pick_broker")?,
        })),
        _ => Err(malformed("pick_broker", "expected a broker triple")),
    }
}

pub(crate) fn parse_find_or_create(value: &Value) -> Result<FindOrCreateReply> {
    let items = as_array(value, "find_or_create")?;
    match items {
        [code] if as_int(code)? == 0 => Ok(FindOrCreateReply::NotFound),
        [code] if as_int(code)? == 1 => Ok(FindOrCreateReply::Retry),
        [code, triple] if as_int(code)? == 0 => {
            let triple = as_array(triple, "find_or_create")?;
            match triple {
                [broker, name, id] => Ok(FindOrCreateReply::Found {
                    broker_id: as_string(broker, "find_or_create")?,
                    name: as_string(name, "find_or_create")?,
                    worker_id: as_string(id, "find_or_create")?,
                }),
                _ => Err(malformed("find_or_create", "expected a worker triple")),
            }
        }
        _ => Err(malformed("find_or_create", "unrecognised reply shape")),
    }
}

pub(crate) fn parse_find_broker(value: &Value) -> Result<FindBrokerReply> {
    let items = as_array(value, "find_broker")?;
    match items {
        [code] if as_int(code)? == 1 => Ok(FindBrokerReply::NotFound),
        [code, broker] if as_int(code)? == 2 => Ok(FindBrokerReply::Invalidated {
            broker_id: as_string(broker, "find_broker")?,
        }),
        [code, quad] if as_int(code)? == 0 => {
            let quad = as_array(quad, "find_broker")?;
            match quad {
                [broker, cluster, state, addr] => Ok(FindBrokerReply::Found {
                    broker_id: as_string(broker, "find_broker")?,
                    cluster: as_string(cluster, "find_broker")?,
                    state: BrokerState::from_wire(&as_string(state, "find_broker")?),
                    addr: as_string(addr, "find_broker")?,
                }),
                _ => Err(malformed("find_broker", "expected a broker quad")),
            }
        }
        _ => Err(malformed("find_broker", "unrecognised reply shape")),
    }
}

pub(crate) fn parse_health_check(value: &Value) -> Result<HealthCheckReply> {
    let items = as_array(value, "health_check")?;
    match items {
        [code] if as_int(code)? == 0 => Ok(HealthCheckReply::Healthy),
        [code] if as_int(code)? == 1 => Ok(HealthCheckReply::SalvageIssued),
        [code, msg] if as_int(code)? == 2 => {
            Ok(HealthCheckReply::Pruned(as_string(msg, "health_check")?))
        }
        _ => Err(malformed("health_check", "unrecognised reply shape")),
    }
}

pub(crate) fn parse_recovery_batch(value: &Value) -> Result<RecoveryBatch> {
    let items = as_array(value, "fetch_for_recovery")?;
    let [records, remaining] = items else {
        return Err(malformed("fetch_for_recovery", "expected [records, remaining]"));
    };

    let mut parsed = Vec::new();
    for raw in as_array(records, "fetch_for_recovery")? {
        let json = as_string(raw, "fetch_for_recovery")?;
        let record: WorkerRecord = serde_json::from_str(&json)
            .map_err(|e| malformed("fetch_for_recovery", format!("bad record: {e}")))?;
        parsed.push(record);
    }

    let remaining = as_int(remaining)?;
    let remaining = u64::try_from(remaining)
        .map_err(|_| malformed("fetch_for_recovery", "negative remaining count"))?;

    Ok(RecoveryBatch {
        records: parsed,
        remaining,
    })
}

fn tag(value: &Value) -> Result<i64> {
    let items = as_array(value, "script")?;
    items
        .first()
        .ok_or_else(|| malformed("script", "empty reply array"))
        .and_then(as_int)
}

fn as_array<'a>(value: &'a Value, script: &str) -> Result<&'a [Value]> {
    match value {
        Value::Array(items) => Ok(items),
        other => Err(malformed(script, format!("expected array, got {other:?}"))),
    }
}

fn as_string(value: &Value, script: &str) -> Result<String> {
    match value {
        Value::BulkString(bytes) => Ok(String::from_utf8_lossy(bytes).into_owned()),
        Value::SimpleString(s) => Ok(s.clone()),
        other => Err(malformed(script, format!("expected string, got {other:?}"))),
    }
}

fn as_int(value: &Value) -> Result<i64> {
    match value {
        Value::Int(i) => Ok(*i),
        Value::BulkString(bytes) => std::str::from_utf8(bytes)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| malformed("script", "non-numeric value")),
        other => Err(malformed("script", format!("expected integer, got {other:?}"))),
    }
}

fn malformed(script: &str, detail: impl std::fmt::Display) -> RegistryError {
    RegistryError::Reply(format!("{script}: {detail}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk(s: &str) -> Value {
        Value::BulkString(s.as_bytes().to_vec())
    }

    #[test]
    fn pick_broker_nil_and_triple() {
        assert_eq!(parse_pick_broker(&Value::Nil).unwrap(), None);

        let value = Value::Array(vec![bulk("br01"), bulk("pvp"), bulk("1.2.3.4:6690")]);
        let picked = parse_pick_broker(&value).unwrap().unwrap();
        assert_eq!(picked.broker_id, "br01");
        assert_eq!(picked.cluster, "pvp");
        assert_eq!(picked.addr, "1.2.3.4:6690");
    }

    #[test]
    fn find_or_create_variants() {
        assert_eq!(
            parse_find_or_create(&Value::Array(vec![Value::Int(0)])).unwrap(),
            FindOrCreateReply::NotFound
        );
        assert_eq!(
            parse_find_or_create(&Value::Array(vec![Value::Int(1)])).unwrap(),
            FindOrCreateReply::Retry
        );

        let found = Value::Array(vec![
            Value::Int(0),
            Value::Array(vec![bulk("br01"), bulk("MyWorker"), bulk("MyWorker#1")]),
        ]);
        assert_eq!(
            parse_find_or_create(&found).unwrap(),
            FindOrCreateReply::Found {
                broker_id: "br01".to_owned(),
                name: "MyWorker".to_owned(),
                worker_id: "MyWorker#1".to_owned(),
            }
        );
    }

    #[test]
    fn find_broker_variants() {
        assert_eq!(
            parse_find_broker(&Value::Array(vec![Value::Int(1)])).unwrap(),
            FindBrokerReply::NotFound
        );

        let invalidated = Value::Array(vec![Value::Int(2), bulk("br02")]);
        assert_eq!(
            parse_find_broker(&invalidated).unwrap(),
            FindBrokerReply::Invalidated {
                broker_id: "br02".to_owned()
            }
        );

        let found = Value::Array(vec![
            Value::Int(0),
            Value::Array(vec![bulk("br01"), bulk("pvp"), bulk("active"), bulk("1.2.3.4:6690")]),
        ]);
        match parse_find_broker(&found).unwrap() {
            FindBrokerReply::Found { broker_id, state, .. } => {
                assert_eq!(broker_id, "br01");
                assert_eq!(state, Some(BrokerState::Active));
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn health_check_variants() {
        assert_eq!(
            parse_health_check(&Value::Array(vec![Value::Int(0)])).unwrap(),
            HealthCheckReply::Healthy
        );
        assert_eq!(
            parse_health_check(&Value::Array(vec![Value::Int(1)])).unwrap(),
            HealthCheckReply::SalvageIssued
        );
        assert_eq!(
            parse_health_check(&Value::Array(vec![Value::Int(2), bulk("removed br02")])).unwrap(),
            HealthCheckReply::Pruned("removed br02".to_owned())
        );
    }

    #[test]
    fn recovery_batch_parses_records() {
        let value = Value::Array(vec![
            Value::Array(vec![bulk(
                r#"{"name":"MyWorker","attributes":{"recoverable":true},"id":"MyWorker#1","createdAt":1700000000000}"#,
            )]),
            Value::Int(3),
        ]);
        let batch = parse_recovery_batch(&value).unwrap();
        assert_eq!(batch.remaining, 3);
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.records[0].id.as_deref(), Some("MyWorker#1"));
        assert!(batch.records[0].attributes.recoverable);
    }

    #[test]
    fn malformed_reply_is_an_error() {
        assert!(parse_find_or_create(&Value::Int(0)).is_err());
        assert!(parse_health_check(&Value::Array(vec![])).is_err());
    }
}
