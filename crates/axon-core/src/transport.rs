//! Publish/subscribe transport abstraction and an in-process broker
//!
//! The bridge never talks to a network client directly. Everything goes
//! through [`Transport`], so the correlator and the state cache can be driven
//! by [`MemoryTransport`] in tests or by any broker client in production.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::topic::topic_matches;

/// Capacity of the inbound/outbound broadcast channels
const CHANNEL_CAPACITY: usize = 1024;

#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("Publish to {topic} failed: {reason}")]
    PublishFailed { topic: String, reason: String },
    #[error("Subscribe to {filter} failed: {reason}")]
    SubscribeFailed { filter: String, reason: String },
    #[error("Transport closed")]
    Closed,
}

/// Delivery guarantee requested from the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QoS {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

/// Options for a single publish
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PublishOptions {
    pub retain: bool,
    pub qos: QoS,
}

impl PublishOptions {
    pub fn retained() -> Self {
        Self {
            retain: true,
            qos: QoS::AtLeastOnce,
        }
    }
}

/// A message received from the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// A message handed to the broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

/// Pub/sub primitives the bridge depends on
///
/// `messages()` plays the role of an `onMessage` handler registration:
/// each receiver sees every inbound message, and dropping it unregisters.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        options: PublishOptions,
    ) -> Result<(), TransportError>;

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), TransportError>;

    fn messages(&self) -> broadcast::Receiver<InboundMessage>;
}

#[derive(Default)]
struct BrokerState {
    filters: HashSet<String>,
    retained: BTreeMap<String, Vec<u8>>,
    published: Vec<PublishedMessage>,
}

/// In-process loopback broker
///
/// Publishes are recorded and, when a subscription matches the topic, echoed
/// back onto the inbound stream like a real broker would. Device traffic is
/// simulated with [`MemoryTransport::inject`].
#[derive(Clone)]
pub struct MemoryTransport {
    state: Arc<Mutex<BrokerState>>,
    inbound_tx: broadcast::Sender<InboundMessage>,
    outbound_tx: broadcast::Sender<PublishedMessage>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        let (inbound_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (outbound_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            inbound_tx,
            outbound_tx,
        }
    }

    /// Deliver a message as if a device had published it
    pub fn inject(&self, topic: impl Into<String>, payload: impl Into<Vec<u8>>) {
        let msg = InboundMessage {
            topic: topic.into(),
            payload: payload.into(),
        };
        trace!(topic = %msg.topic, bytes = msg.payload.len(), "Injecting inbound message");
        // No receivers just means nobody is listening yet
        let _ = self.inbound_tx.send(msg);
    }

    /// Everything published so far, in order
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    /// Published messages for one topic, in order
    pub fn published_to(&self, topic: &str) -> Vec<PublishedMessage> {
        self.lock()
            .published
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Last retained payload for a topic
    pub fn retained(&self, topic: &str) -> Option<Vec<u8>> {
        self.lock().retained.get(topic).cloned()
    }

    /// Subscribe to the stream of outbound publishes
    pub fn outbound(&self) -> broadcast::Receiver<PublishedMessage> {
        self.outbound_tx.subscribe()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BrokerState> {
        // The broker state holds no invariants a panicking writer could break
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        options: PublishOptions,
    ) -> Result<(), TransportError> {
        let loopback = {
            let mut state = self.lock();
            if options.retain {
                state.retained.insert(topic.to_string(), payload.clone());
            }
            state.published.push(PublishedMessage {
                topic: topic.to_string(),
                payload: payload.clone(),
                retain: options.retain,
            });
            state.filters.iter().any(|f| topic_matches(f, topic))
        };

        debug!(topic = %topic, retain = options.retain, bytes = payload.len(), "Published");

        let _ = self.outbound_tx.send(PublishedMessage {
            topic: topic.to_string(),
            payload: payload.clone(),
            retain: options.retain,
        });

        if loopback {
            let _ = self.inbound_tx.send(InboundMessage {
                topic: topic.to_string(),
                payload,
            });
        }
        Ok(())
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), TransportError> {
        self.lock().filters.insert(filter.to_string());
        debug!(filter = %filter, qos = ?qos, "Subscribed");
        Ok(())
    }

    fn messages(&self) -> broadcast::Receiver<InboundMessage> {
        self.inbound_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_records_and_retains() {
        let transport = MemoryTransport::new();
        transport
            .publish("a/b", b"one".to_vec(), PublishOptions::retained())
            .await
            .unwrap();
        transport
            .publish("a/b", b"two".to_vec(), PublishOptions::default())
            .await
            .unwrap();

        assert_eq!(transport.published_to("a/b").len(), 2);
        assert_eq!(transport.retained("a/b").unwrap(), b"one".to_vec());
        assert!(transport.retained("a/c").is_none());
    }

    #[tokio::test]
    async fn test_loopback_only_for_subscribed_topics() {
        let transport = MemoryTransport::new();
        let mut rx = transport.messages();
        transport.subscribe("evt/#", QoS::AtLeastOnce).await.unwrap();

        transport
            .publish("cmd/x", b"ignored".to_vec(), PublishOptions::default())
            .await
            .unwrap();
        transport
            .publish("evt/x", b"echoed".to_vec(), PublishOptions::default())
            .await
            .unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.topic, "evt/x");
        assert_eq!(msg.payload, b"echoed".to_vec());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_inject_reaches_every_receiver() {
        let transport = MemoryTransport::new();
        let mut first = transport.messages();
        let mut second = transport.messages();

        transport.inject("evt/x", "hello");

        assert_eq!(first.recv().await.unwrap().topic, "evt/x");
        assert_eq!(second.recv().await.unwrap().topic, "evt/x");
    }
}
