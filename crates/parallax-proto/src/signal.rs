//! Control signals carried over the registry's pub/sub channels.

use serde::{Deserialize, Serialize};

/// A control signal on the broadcast channel.
///
/// The broadcast channel (`<chPrefix>:*`, a literal channel name) carries
/// only this grammar; the unicast channel carries only empty liveness
/// probes. [`Signal::parse`] returns `None` for probes so callers can skip
/// them without logging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "sig")]
pub enum Signal {
    /// Recoverable workers are waiting in the recovery set.
    #[serde(rename = "recover")]
    Recover,

    /// A broker was found dead; peers should salvage its workers.
    #[serde(rename = "salvage")]
    Salvage {
        clustername: String,
        #[serde(rename = "brokerId")]
        broker_id: String,
    },

    /// The receiving broker should destroy itself and start again.
    #[serde(rename = "restart")]
    Restart,
}

impl Signal {
    /// Parses a raw pub/sub payload.
    ///
    /// - empty payload (liveness probe) → `Ok(None)`
    /// - known signal → `Ok(Some(signal))`
    /// - anything else → `Err` with the decode failure
    pub fn parse(payload: &[u8]) -> Result<Option<Self>, serde_json::Error> {
        if payload.is_empty() {
            return Ok(None);
        }
        serde_json::from_slice(payload).map(Some)
    }

    /// Serialises the signal for publishing.
    #[must_use]
    pub fn to_payload(&self) -> String {
        serde_json::to_string(self).expect("signal grammar always serialises")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_payload_is_probe() {
        assert_eq!(Signal::parse(b"").unwrap(), None);
    }

    #[test]
    fn recover_roundtrip() {
        let payload = Signal::Recover.to_payload();
        assert_eq!(payload, r#"{"sig":"recover"}"#);
        assert_eq!(Signal::parse(payload.as_bytes()).unwrap(), Some(Signal::Recover));
    }

    #[test]
    fn salvage_carries_cluster_and_broker() {
        let parsed =
            Signal::parse(br#"{"sig":"salvage","clustername":"pvp","brokerId":"br02"}"#).unwrap();
        assert_eq!(
            parsed,
            Some(Signal::Salvage {
                clustername: "pvp".to_owned(),
                broker_id: "br02".to_owned(),
            })
        );
    }

    #[test]
    fn unknown_signal_is_an_error() {
        assert!(Signal::parse(br#"{"sig":"dance"}"#).is_err());
    }
}
