//! Attribute samples and their resolved form

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::envelope::{Envelope, ValueType};

/// One historical sample of an attribute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeValueEntry {
    /// Sample time; devices report several formats, see [`parse_timestamp`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<Value>,
    #[serde(default)]
    pub val: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub val_t: Option<ValueType>,
    /// Remaining root fields (`props`, `event`, ...), which may carry a discriminator
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AttributeValueEntry {
    pub fn new(val: Value) -> Self {
        Self {
            ts: None,
            val,
            val_t: None,
            extra: Map::new(),
        }
    }

    pub fn at(mut self, ts: impl Into<String>) -> Self {
        self.ts = Some(Value::String(ts.into()));
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Build a sample from an attribute report envelope
    pub fn from_envelope(env: &Envelope) -> Self {
        let mut extra = Map::new();
        if !env.props.is_empty() {
            extra.insert("props".to_string(), Value::Object(env.props.clone()));
        }
        Self {
            ts: (!env.ctime.is_empty()).then(|| Value::String(env.ctime.clone())),
            val: env.val.clone(),
            val_t: Some(env.val_t),
            extra,
        }
    }

    /// Parsed sample time, if present and understood
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.ts.as_ref().and_then(parse_timestamp)
    }

    /// Look up a dotted path at the entry root, then inside the value payload
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let rest: Vec<&str> = segments.collect();

        let at_root = match first {
            "val" => Some(&self.val),
            _ => self.extra.get(first),
        }
        .and_then(|v| descend(v, &rest))
        .filter(|v| !v.is_null());

        at_root.or_else(|| {
            let mut full = Vec::with_capacity(rest.len() + 1);
            full.push(first);
            full.extend(rest.iter().copied());
            descend(&self.val, &full).filter(|v| !v.is_null())
        })
    }

    /// Value payload as stored under a discriminator key
    pub fn payload(&self) -> Value {
        match &self.val {
            Value::Object(map) => Value::Object(map.clone()),
            scalar => {
                let mut map = Map::new();
                map.insert("val".to_string(), scalar.clone());
                Value::Object(map)
            }
        }
    }
}

fn descend<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(value, |current, key| current.get(*key))
}

/// Parse a sample timestamp
///
/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS ±ZZZZ`, a naive `YYYY-MM-DD HH:MM:SS`
/// (taken as UTC) and Unix epoch numbers (seconds or milliseconds).
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_timestamp_str(s.trim()),
        Value::Number(n) => {
            let raw = n.as_i64()?;
            // Anything past year 2286 in seconds is really milliseconds
            if raw.abs() >= 10_000_000_000 {
                Utc.timestamp_millis_opt(raw).single()
            } else {
                Utc.timestamp_opt(raw, 0).single()
            }
        }
        _ => None,
    }
}

fn parse_timestamp_str(s: &str) -> Option<DateTime<Utc>> {
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S %z", "%Y-%m-%d %H:%M:%S%.f %z", "%Y-%m-%dT%H:%M:%S%z"] {
        if let Ok(dt) = DateTime::<FixedOffset>::parse_from_str(s, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    None
}

/// Current value of one attribute in a snapshot
///
/// Serialized untagged, so a published document does not say which variant
/// produced an object; only the cache's in-memory copy knows.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ResolvedAttributeValue {
    /// Discriminator key to payload object
    Discriminated(BTreeMap<String, Value>),
    /// Latest raw value of an untyped attribute
    Single(Value),
}

impl ResolvedAttributeValue {
    pub fn is_discriminated(&self) -> bool {
        matches!(self, Self::Discriminated(_))
    }

    pub fn as_single(&self) -> Option<&Value> {
        match self {
            Self::Single(v) => Some(v),
            Self::Discriminated(_) => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Self::Discriminated(map) => map.get(key),
            Self::Single(_) => None,
        }
    }
}
