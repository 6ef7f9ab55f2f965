//! Consolidated device state cache
//!
//! Downstream consumers read one self-contained document per device. Reports
//! for single attributes arrive independently and in any order, so the cache
//! keeps the full last-published document for every topic and patches it in
//! place; a one-field update never drops its siblings.
//!
//! Each topic's read-modify-publish sequence runs under the cache's write
//! lock, so a full replacement and an incremental patch cannot interleave.

use axon_core::{
    AttributeValueEntry, DeviceSnapshot, PublishOptions, RawDeviceState, ResolvedAttributeValue,
    Resolver, TopicScheme, Transport, TransportError,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, trace, warn};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Snapshot encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Snapshot publish failed: {0}")]
    Publish(#[from] TransportError),
}

/// Cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Attributes never patched incrementally; they only change on full replacement
    #[serde(default = "default_excluded")]
    pub excluded_attributes: HashSet<String>,
}

fn default_excluded() -> HashSet<String> {
    ["meter_ext".to_string()].into_iter().collect()
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            excluded_attributes: default_excluded(),
        }
    }
}

/// Outcome of an incremental attribute report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PatchOutcome {
    /// Snapshots that were changed and republished
    pub published: usize,
    /// Snapshots that contained the address but did not change
    pub unchanged: usize,
}

/// Topic to last-published device snapshot
pub struct StateCache {
    transport: Arc<dyn Transport>,
    resolver: Resolver,
    topics: TopicScheme,
    config: CacheConfig,
    entries: RwLock<BTreeMap<String, DeviceSnapshot>>,
}

impl StateCache {
    pub fn new(
        transport: Arc<dyn Transport>,
        resolver: Resolver,
        topics: TopicScheme,
        config: CacheConfig,
    ) -> Self {
        Self {
            transport,
            resolver,
            topics,
            config,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// Rebuild a device's snapshot from a full state report and publish it
    pub async fn replace_snapshot(
        &self,
        topic: &str,
        raw: &RawDeviceState,
    ) -> Result<DeviceSnapshot, CacheError> {
        let snapshot = DeviceSnapshot::from_raw(raw, &self.resolver);
        let payload = snapshot.to_vec()?;

        let mut entries = self.entries.write().await;
        self.transport
            .publish(topic, payload, PublishOptions::retained())
            .await?;
        entries.insert(topic.to_string(), snapshot.clone());

        info!(
            topic = %topic,
            device = %raw.device_key(),
            services = snapshot.len(),
            "Snapshot replaced"
        );
        Ok(snapshot)
    }

    /// Patch one attribute of every snapshot holding the event's address
    ///
    /// Unknown addresses and excluded attributes are silently ignored.
    pub async fn apply_attribute_report(
        &self,
        event_topic: &str,
        entry: &AttributeValueEntry,
        attribute: &str,
    ) -> Result<PatchOutcome, CacheError> {
        let mut outcome = PatchOutcome::default();

        if self.config.excluded_attributes.contains(attribute) {
            trace!(attribute = %attribute, "Attribute excluded from incremental updates");
            return Ok(outcome);
        }
        let Some(address) = self.topics.address_of_event(event_topic) else {
            debug!(topic = %event_topic, "Not an event topic, ignoring report");
            return Ok(outcome);
        };
        let discriminator = self.resolver.discriminator_of(attribute, entry);

        let mut entries = self.entries.write().await;
        let mut first_error = None;

        for (topic, snapshot) in entries.iter_mut() {
            if !snapshot.contains_address(address) {
                continue;
            }

            let mut patched = snapshot.clone();
            let Some(state) = patched.service_mut(address) else {
                continue;
            };
            let current = state.get(attribute);

            let next = match (&discriminator, current) {
                (Some(key), Some(ResolvedAttributeValue::Discriminated(map))) => {
                    let mut map = map.clone();
                    map.insert(key.clone(), entry.payload());
                    ResolvedAttributeValue::Discriminated(map)
                }
                (Some(key), _) => {
                    let mut map = BTreeMap::new();
                    map.insert(key.clone(), entry.payload());
                    ResolvedAttributeValue::Discriminated(map)
                }
                (None, Some(ResolvedAttributeValue::Discriminated(_))) => {
                    debug!(
                        topic = %topic,
                        address = %address,
                        attribute = %attribute,
                        "Report without discriminator for a discriminated attribute, ignoring"
                    );
                    outcome.unchanged += 1;
                    continue;
                }
                (None, _) => ResolvedAttributeValue::Single(entry.val.clone()),
            };

            if current == Some(&next) {
                trace!(topic = %topic, attribute = %attribute, "Report does not change snapshot");
                outcome.unchanged += 1;
                continue;
            }
            state.insert(attribute.to_string(), next);

            let payload = match patched.to_vec() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(topic = %topic, error = %e, "Failed to encode patched snapshot");
                    if first_error.is_none() {
                        first_error = Some(CacheError::Encode(e));
                    }
                    continue;
                }
            };
            match self
                .transport
                .publish(topic, payload, PublishOptions::retained())
                .await
            {
                Ok(()) => {
                    debug!(
                        topic = %topic,
                        address = %address,
                        attribute = %attribute,
                        discriminator = ?discriminator,
                        "Snapshot patched"
                    );
                    *snapshot = patched;
                    outcome.published += 1;
                }
                Err(e) => {
                    warn!(topic = %topic, error = %e, "Failed to publish patched snapshot");
                    if first_error.is_none() {
                        first_error = Some(CacheError::Publish(e));
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(outcome),
        }
    }

    /// Current snapshot for a topic
    pub async fn get(&self, topic: &str) -> Option<DeviceSnapshot> {
        self.entries.read().await.get(topic).cloned()
    }

    /// Topics with a cached snapshot
    pub async fn topics(&self) -> Vec<String> {
        self.entries.read().await.keys().cloned().collect()
    }

    /// Topics whose snapshot contains a service address
    pub async fn topics_for_address(&self, address: &str) -> Vec<String> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|(_, s)| s.contains_address(address))
            .map(|(t, _)| t.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
