//! Peer wire message types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single framed message between peer brokers.
///
/// Wire fields:
/// - `m`: method name, present on requests
/// - `seq`: correlation sequence, present on ask-style requests and all
///   responses, absent on tell
/// - `wid`: target worker id, absent on broker-to-broker RPC
/// - `pl`: payload; responses carry a [`ResponseBody`]
///
/// Unknown fields are ignored on decode; compatibility is handled at this
/// schema level rather than with a frame version byte.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub m: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wid: Option<String>,
    #[serde(default)]
    pub pl: Value,
}

impl PeerMessage {
    /// Builds an ask-style request expecting a correlated response.
    #[must_use]
    pub fn request(method: impl Into<String>, seq: u64, wid: Option<String>, pl: Value) -> Self {
        Self {
            m: Some(method.into()),
            seq: Some(seq),
            wid,
            pl,
        }
    }

    /// Builds a fire-and-forget request.
    #[must_use]
    pub fn tell(method: impl Into<String>, wid: Option<String>, pl: Value) -> Self {
        Self {
            m: Some(method.into()),
            seq: None,
            wid,
            pl,
        }
    }

    /// Builds a success response for `seq`.
    #[must_use]
    pub fn response_ok(seq: u64, res: Value) -> Self {
        Self {
            m: None,
            seq: Some(seq),
            wid: None,
            pl: serde_json::json!({ "res": res }),
        }
    }

    /// Builds an error response for `seq`, preserving name and message.
    #[must_use]
    pub fn response_err(seq: u64, name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            m: None,
            seq: Some(seq),
            wid: None,
            pl: serde_json::json!({
                "err": ErrorBody {
                    name: name.into(),
                    message: message.into(),
                }
            }),
        }
    }

    /// True for correlated responses (sequence present, no method).
    #[must_use]
    pub fn is_response(&self) -> bool {
        self.seq.is_some() && self.m.is_none()
    }

    /// Interprets the payload of a response message.
    ///
    /// Returns the `res` value on success, the preserved error on failure.
    /// A malformed body maps to a generic error rather than a panic.
    pub fn response_result(&self) -> Result<Value, ErrorBody> {
        match serde_json::from_value::<ResponseBody>(self.pl.clone()) {
            Ok(ResponseBody { err: Some(err), .. }) => Err(err),
            Ok(ResponseBody { res, .. }) => Ok(res.unwrap_or(Value::Null)),
            Err(e) => Err(ErrorBody {
                name: "Protocol".to_owned(),
                message: format!("malformed response body: {e}"),
            }),
        }
    }
}

/// Response payload: exactly one of `res` or `err`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub res: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<ErrorBody>,
}

/// Application error carried back to the asking agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Error name (category or application type name).
    pub name: String,
    /// Human-readable message.
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_wire_shape() {
        let message = PeerMessage::request("greet", 12, Some("w1".into()), json!({"x": 1}));
        let wire = serde_json::to_value(&message).unwrap();
        assert_eq!(
            wire,
            json!({"m": "greet", "seq": 12, "wid": "w1", "pl": {"x": 1}})
        );
    }

    #[test]
    fn tell_omits_seq() {
        let message = PeerMessage::tell("notify", None, json!(null));
        let wire = serde_json::to_string(&message).unwrap();
        assert!(!wire.contains("seq"));
        assert!(!wire.contains("wid"));
    }

    #[test]
    fn response_ok_roundtrip() {
        let message = PeerMessage::response_ok(3, json!({"answer": 42}));
        assert!(message.is_response());
        assert_eq!(message.response_result().unwrap(), json!({"answer": 42}));
    }

    #[test]
    fn response_err_preserves_name_and_message() {
        let message = PeerMessage::response_err(3, "RangeError", "out of bounds");
        let err = message.response_result().unwrap_err();
        assert_eq!(err.name, "RangeError");
        assert_eq!(err.message, "out of bounds");
    }

    #[test]
    fn unknown_fields_ignored() {
        let message: PeerMessage =
            serde_json::from_str(r#"{"m":"x","pl":null,"future_field":true}"#).unwrap();
        assert_eq!(message.m.as_deref(), Some("x"));
    }
}
