//! Consolidated per-device state documents

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::warn;

use crate::attribute::{AttributeValueEntry, ResolvedAttributeValue};
use crate::resolver::Resolver;

/// Attribute name to current value for one service address
pub type ServiceState = BTreeMap<String, ResolvedAttributeValue>;

/// Full state document for one device, keyed by service address
///
/// Backed by ordered maps so that the same content always encodes to the same
/// bytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct DeviceSnapshot {
    services: BTreeMap<String, ServiceState>,
}

impl DeviceSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve every attribute of a raw device state report
    pub fn from_raw(raw: &RawDeviceState, resolver: &Resolver) -> Self {
        let mut snapshot = Self::new();

        for service in &raw.services {
            if service.addr.is_empty() {
                warn!(device = %raw.device_key(), service = %service.name, "Service without address, skipping");
                continue;
            }

            let mut samples: BTreeMap<&str, Vec<AttributeValueEntry>> = BTreeMap::new();
            for attribute in &service.attributes {
                samples
                    .entry(attribute.name.as_str())
                    .or_default()
                    .extend(attribute.values.iter().cloned());
            }

            let state = snapshot.services.entry(service.addr.clone()).or_default();
            for (name, values) in samples {
                if let Some(resolved) = resolver.resolve(name, &values) {
                    state.insert(name.to_string(), resolved);
                }
            }
        }

        snapshot
    }

    pub fn contains_address(&self, address: &str) -> bool {
        self.services.contains_key(address)
    }

    pub fn service(&self, address: &str) -> Option<&ServiceState> {
        self.services.get(address)
    }

    pub fn service_mut(&mut self, address: &str) -> Option<&mut ServiceState> {
        self.services.get_mut(address)
    }

    pub fn attribute(&self, address: &str, name: &str) -> Option<&ResolvedAttributeValue> {
        self.services.get(address).and_then(|s| s.get(name))
    }

    pub fn insert_service(&mut self, address: impl Into<String>, state: ServiceState) {
        self.services.insert(address.into(), state);
    }

    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Encode as the published JSON document
    pub fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Raw device state as reported by the controller
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawDeviceState {
    /// Device id; controllers send either numbers or strings
    #[serde(default)]
    pub id: Value,
    #[serde(default)]
    pub services: Vec<RawService>,
}

impl RawDeviceState {
    /// Device id rendered as a topic segment
    pub fn device_key(&self) -> String {
        match &self.id {
            Value::String(s) => s.clone(),
            Value::Null => "unknown".to_string(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawService {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub addr: String,
    #[serde(default)]
    pub attributes: Vec<RawAttribute>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawAttribute {
    pub name: String,
    #[serde(default)]
    pub values: Vec<AttributeValueEntry>,
}
