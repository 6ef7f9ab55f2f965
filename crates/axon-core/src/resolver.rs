//! Attribute value resolution
//!
//! Devices report an attribute as a list of historical samples. The resolver
//! reduces that list to the value a consumer should see right now:
//! - untyped attributes resolve to the newest sample's raw value
//! - discriminated attributes (several alarm events, several meter units, ...)
//!   resolve to a map holding the newest sample per discriminator key
//! - identity-keyed attributes (parameter tables) resolve to a map keyed by
//!   each sample's own identity field, ignoring timestamps
//!
//! Which of these applies is decided per attribute name by a
//! [`DiscriminatorConfig`] supplied at construction.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use tracing::trace;

use crate::attribute::{AttributeValueEntry, ResolvedAttributeValue};

/// How the discriminator of an attribute is extracted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscriminatorRule {
    /// Dotted path looked up at the sample root, then inside its value
    Field(String),
    /// Samples are keyed by this field and timestamps are ignored
    Identity(String),
    /// Never discriminated
    None,
}

/// Per-attribute discriminator rules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscriminatorConfig {
    /// Field used when an attribute has no override
    #[serde(default = "default_field")]
    pub default_field: String,
    /// Rules by attribute name; replaces the built-in table when given
    #[serde(default = "default_overrides")]
    pub overrides: HashMap<String, DiscriminatorRule>,
}

fn default_field() -> String {
    "type".to_string()
}

fn default_overrides() -> HashMap<String, DiscriminatorRule> {
    let mut overrides = HashMap::new();
    overrides.insert("alarm".to_string(), DiscriminatorRule::Field("event".to_string()));
    overrides.insert("meter".to_string(), DiscriminatorRule::Field("props.unit".to_string()));
    overrides.insert(
        "meter_export".to_string(),
        DiscriminatorRule::Field("props.unit".to_string()),
    );
    overrides.insert(
        "config".to_string(),
        DiscriminatorRule::Identity("parameter_id".to_string()),
    );
    overrides
}

impl Default for DiscriminatorConfig {
    fn default() -> Self {
        Self {
            default_field: default_field(),
            overrides: default_overrides(),
        }
    }
}

impl DiscriminatorConfig {
    /// Config without any per-attribute overrides
    pub fn empty() -> Self {
        Self {
            default_field: default_field(),
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(mut self, attribute: impl Into<String>, rule: DiscriminatorRule) -> Self {
        self.overrides.insert(attribute.into(), rule);
        self
    }

    pub fn rule_for(&self, attribute: &str) -> DiscriminatorRule {
        self.overrides
            .get(attribute)
            .cloned()
            .unwrap_or_else(|| DiscriminatorRule::Field(self.default_field.clone()))
    }
}

/// Reduces attribute samples to current values
#[derive(Debug, Clone, Default)]
pub struct Resolver {
    config: DiscriminatorConfig,
}

impl Resolver {
    pub fn new(config: DiscriminatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DiscriminatorConfig {
        &self.config
    }

    /// Discriminator key carried by a single sample, if any
    pub fn discriminator_of(&self, attribute: &str, entry: &AttributeValueEntry) -> Option<String> {
        match self.config.rule_for(attribute) {
            DiscriminatorRule::Field(path) | DiscriminatorRule::Identity(path) => {
                entry.lookup(&path).and_then(key_string)
            }
            DiscriminatorRule::None => None,
        }
    }

    /// Resolve an attribute's samples; `None` means the attribute is omitted
    pub fn resolve(
        &self,
        attribute: &str,
        entries: &[AttributeValueEntry],
    ) -> Option<ResolvedAttributeValue> {
        if entries.is_empty() {
            return None;
        }

        if let DiscriminatorRule::Identity(path) = self.config.rule_for(attribute) {
            return resolve_by_identity(attribute, &path, entries);
        }

        let mut sorted: Vec<&AttributeValueEntry> = entries.iter().collect();
        sorted.sort_by(|a, b| newest_first(a, b));

        let keyed: Vec<(Option<String>, &AttributeValueEntry)> = sorted
            .into_iter()
            .map(|entry| (self.discriminator_of(attribute, entry), entry))
            .collect();

        if keyed.iter().all(|(key, _)| key.is_none()) {
            return keyed
                .first()
                .map(|(_, entry)| ResolvedAttributeValue::Single(entry.val.clone()));
        }

        let mut map = BTreeMap::new();
        for (key, entry) in keyed {
            if let Some(key) = key {
                map.entry(key).or_insert_with(|| entry.payload());
            } else {
                trace!(attribute = %attribute, "Dropping sample without discriminator");
            }
        }
        Some(ResolvedAttributeValue::Discriminated(map))
    }
}

fn resolve_by_identity(
    attribute: &str,
    path: &str,
    entries: &[AttributeValueEntry],
) -> Option<ResolvedAttributeValue> {
    let mut map = BTreeMap::new();
    for entry in entries {
        match entry.lookup(path).and_then(key_string) {
            Some(key) => {
                map.insert(key, entry.payload());
            }
            None => trace!(attribute = %attribute, field = %path, "Sample has no identity field"),
        }
    }
    (!map.is_empty()).then_some(ResolvedAttributeValue::Discriminated(map))
}

/// Newest first; samples without a usable timestamp go last, in input order
fn newest_first(a: &AttributeValueEntry, b: &AttributeValueEntry) -> Ordering {
    match (a.timestamp(), b.timestamp()) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn key_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
