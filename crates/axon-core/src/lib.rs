//! Axon Core - Message envelopes, transport abstraction and attribute resolution
//!
//! This crate provides the foundational types for the Axon bridge:
//! - Command/event envelopes exchanged with devices
//! - The pub/sub transport trait and an in-process broker
//! - Topic layout for the command and event namespaces
//! - Attribute samples, the attribute value resolver and device snapshots

pub mod attribute;
pub mod envelope;
pub mod resolver;
pub mod snapshot;
pub mod topic;
pub mod transport;

pub use attribute::{parse_timestamp, AttributeValueEntry, ResolvedAttributeValue};
pub use envelope::{Envelope, EnvelopeError, MessageKind, ValueType, ERROR_REPORT_TYPE};
pub use resolver::{DiscriminatorConfig, DiscriminatorRule, Resolver};
pub use snapshot::{DeviceSnapshot, RawAttribute, RawDeviceState, RawService, ServiceState};
pub use topic::{topic_matches, TopicScheme};
pub use transport::{
    InboundMessage, MemoryTransport, PublishOptions, PublishedMessage, QoS, Transport,
    TransportError,
};
