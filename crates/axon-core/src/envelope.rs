//! Message envelope exchanged with devices over the pub/sub transport
//!
//! Every command and event travels as a JSON envelope. Commands carry a fresh
//! `uid`; responses are expected to echo it back in `corid`, although some
//! device adapters leave `corid` empty and have to be matched by topic or by
//! event name instead.

use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Envelope protocol version
pub const ENVELOPE_VERSION: &str = "1";

/// Namespace prefix of command message types
pub const CMD_TYPE_PREFIX: &str = "cmd.";

/// Namespace prefix of event message types
pub const EVT_TYPE_PREFIX: &str = "evt.";

/// Distinguished message type used by devices to report a failed command
pub const ERROR_REPORT_TYPE: &str = "evt.error.report";

#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("Malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Envelope encoding failed: {0}")]
    Encode(serde_json::Error),
}

/// Declared type of the `val` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    String,
    Int,
    Float,
    Bool,
    #[default]
    Null,
    StrArray,
    IntArray,
    FloatArray,
    StrMap,
    IntMap,
    FloatMap,
    BoolMap,
    Object,
    Bin,
}

impl ValueType {
    /// Infer the closest declared type for a JSON value
    pub fn infer(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(_) => Self::Bool,
            Value::Number(n) if n.is_i64() || n.is_u64() => Self::Int,
            Value::Number(_) => Self::Float,
            Value::String(_) => Self::String,
            Value::Array(items) => {
                if items.iter().all(|v| v.is_i64() || v.is_u64()) {
                    Self::IntArray
                } else if items.iter().all(Value::is_number) {
                    Self::FloatArray
                } else {
                    Self::StrArray
                }
            }
            Value::Object(map) => {
                if map.is_empty() {
                    Self::Object
                } else if map.values().all(Value::is_string) {
                    Self::StrMap
                } else if map.values().all(|v| v.is_i64() || v.is_u64()) {
                    Self::IntMap
                } else if map.values().all(Value::is_number) {
                    Self::FloatMap
                } else if map.values().all(Value::is_boolean) {
                    Self::BoolMap
                } else {
                    Self::Object
                }
            }
        }
    }
}

/// A command or event envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Correlation id; responses echo the request `uid` here
    #[serde(default)]
    pub corid: Option<String>,
    /// Creation time (ISO 8601)
    #[serde(default, deserialize_with = "null_as_default")]
    pub ctime: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub props: Map<String, Value>,
    /// Topic the sender expects responses on
    #[serde(default)]
    pub resp_to: Option<String>,
    /// Service name the message addresses or originates from
    #[serde(default, deserialize_with = "null_as_default")]
    pub serv: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub src: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub tags: Vec<String>,
    /// Message type, e.g. `cmd.lvl.set` or `evt.lvl.report`
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub uid: String,
    #[serde(default)]
    pub val: Value,
    #[serde(default, deserialize_with = "null_as_default")]
    pub val_t: ValueType,
    #[serde(default = "default_version", deserialize_with = "null_as_version")]
    pub ver: String,
}

fn default_version() -> String {
    ENVELOPE_VERSION.to_string()
}

/// Devices send `null` for fields they leave unset
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn null_as_version<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_else(default_version))
}

impl Envelope {
    /// Build a new command envelope with a fresh `uid`
    pub fn command(
        msg_type: impl Into<String>,
        service: impl Into<String>,
        value: Value,
        value_type: ValueType,
    ) -> Self {
        Self {
            corid: None,
            ctime: Utc::now().to_rfc3339(),
            props: Map::new(),
            resp_to: None,
            serv: service.into(),
            src: String::new(),
            tags: Vec::new(),
            msg_type: msg_type.into(),
            uid: Uuid::new_v4().to_string(),
            val: value,
            val_t: value_type,
            ver: default_version(),
        }
    }

    pub fn with_props(mut self, props: Map<String, Value>) -> Self {
        self.props = props;
        self
    }

    pub fn with_source(mut self, src: impl Into<String>) -> Self {
        self.src = src.into();
        self
    }

    pub fn with_response_topic(mut self, resp_to: impl Into<String>) -> Self {
        self.resp_to = Some(resp_to.into());
        self
    }

    /// Parse an envelope from a raw payload
    pub fn from_slice(payload: &[u8]) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Encode the envelope as JSON bytes
    pub fn to_vec(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(EnvelopeError::Encode)
    }

    /// Correlation id, treating an empty string the same as a missing one
    pub fn correlation_id(&self) -> Option<&str> {
        self.corid.as_deref().filter(|id| !id.is_empty())
    }

    pub fn is_event(&self) -> bool {
        self.msg_type.starts_with(EVT_TYPE_PREFIX)
    }

    pub fn is_error_report(&self) -> bool {
        self.msg_type == ERROR_REPORT_TYPE
    }
}

/// A message type split into its `namespace.domain.verb` segments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageKind<'a> {
    pub namespace: &'a str,
    pub domain: &'a str,
    pub verb: &'a str,
}

impl<'a> MessageKind<'a> {
    /// Split a message type; anything but exactly three segments is rejected
    pub fn parse(msg_type: &'a str) -> Option<Self> {
        let mut parts = msg_type.split('.');
        let namespace = parts.next()?;
        let domain = parts.next()?;
        let verb = parts.next()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            namespace,
            domain,
            verb,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_envelope_shape() {
        let env = Envelope::command("cmd.lvl.set", "out_lvl_switch", json!(40), ValueType::Int)
            .with_source("axon")
            .with_response_topic("pt:j1/mt:rsp/rt:app/rn:axon/ad:1");
        let encoded: Value = serde_json::from_slice(&env.to_vec().unwrap()).unwrap();

        assert_eq!(encoded["corid"], Value::Null);
        assert_eq!(encoded["type"], "cmd.lvl.set");
        assert_eq!(encoded["serv"], "out_lvl_switch");
        assert_eq!(encoded["val_t"], "int");
        assert_eq!(encoded["ver"], "1");
        assert_eq!(encoded["tags"], json!([]));
        assert_eq!(encoded["props"], json!({}));
        assert!(!env.uid.is_empty());
    }

    #[test]
    fn test_parse_sparse_response() {
        let payload = br#"{"type":"evt.lvl.report","serv":"out_lvl_switch","val":40,"val_t":"int"}"#;
        let env = Envelope::from_slice(payload).unwrap();
        assert_eq!(env.correlation_id(), None);
        assert!(env.is_event());
        assert!(!env.is_error_report());
        assert_eq!(env.ver, "1");
    }

    #[test]
    fn test_null_fields_take_defaults() {
        let payload = br#"{"type":"evt.lvl.report","serv":"out_lvl_switch","val_t":null,"val":40,
            "props":null,"tags":null,"src":null,"uid":null,"ctime":null,"ver":null,"corid":"abc"}"#;
        let env = Envelope::from_slice(payload).unwrap();
        assert_eq!(env.correlation_id(), Some("abc"));
        assert!(env.props.is_empty());
        assert!(env.tags.is_empty());
        assert_eq!(env.src, "");
        assert_eq!(env.uid, "");
        assert_eq!(env.ctime, "");
        assert_eq!(env.val_t, ValueType::Null);
        assert_eq!(env.ver, "1");
        assert_eq!(env.val, json!(40));
    }

    #[test]
    fn test_empty_corid_is_absent() {
        let payload = br#"{"type":"evt.error.report","corid":"","serv":"x"}"#;
        let env = Envelope::from_slice(payload).unwrap();
        assert_eq!(env.correlation_id(), None);
        assert!(env.is_error_report());
    }

    #[test]
    fn test_malformed_payload() {
        assert!(Envelope::from_slice(b"not json").is_err());
        assert!(Envelope::from_slice(br#"{"serv":"missing type"}"#).is_err());
    }

    #[test]
    fn test_message_kind() {
        let kind = MessageKind::parse("evt.lvl.report").unwrap();
        assert_eq!(kind.namespace, "evt");
        assert_eq!(kind.domain, "lvl");
        assert_eq!(kind.verb, "report");
        assert!(MessageKind::parse("evt.lvl").is_none());
        assert!(MessageKind::parse("evt.a.b.c").is_none());
    }

    #[test]
    fn test_value_type_inference() {
        assert_eq!(ValueType::infer(&json!(true)), ValueType::Bool);
        assert_eq!(ValueType::infer(&json!(3)), ValueType::Int);
        assert_eq!(ValueType::infer(&json!(3.5)), ValueType::Float);
        assert_eq!(ValueType::infer(&json!(["a"])), ValueType::StrArray);
        assert_eq!(ValueType::infer(&json!({"a": 1})), ValueType::IntMap);
        assert_eq!(ValueType::infer(&json!({"a": {"b": 1}})), ValueType::Object);
    }
}
