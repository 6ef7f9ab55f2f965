//! Application state management

use anyhow::Result;
use axon_core::{MemoryTransport, Resolver, Transport};
use axon_rpc::Correlator;
use axon_state::StateCache;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use crate::bridge::Bridge;
use crate::config::Config;

/// Shared application state
pub struct AppState {
    /// Broker connection; the in-process broker stands in for a real one
    pub transport: Arc<MemoryTransport>,
    /// Request/response correlation
    pub correlator: Arc<Correlator>,
    /// Consolidated per-device snapshots
    pub cache: Arc<StateCache>,
    /// Inbound dispatch
    pub bridge: Arc<Bridge>,
    /// Configuration
    pub config: Config,
}

impl AppState {
    /// Create new application state and start the dispatch loop
    pub async fn new(config: Config) -> Result<Arc<Self>> {
        let transport = Arc::new(MemoryTransport::new());
        let shared: Arc<dyn Transport> = transport.clone();

        let correlator = Arc::new(Correlator::new(
            shared.clone(),
            config.to_correlator_config(),
        ));
        let cache = Arc::new(StateCache::new(
            shared,
            Resolver::new(config.resolver.clone()),
            config.bridge.topics.clone(),
            config.cache.clone(),
        ));
        let bridge = Arc::new(Bridge::new(
            correlator.clone(),
            cache.clone(),
            config.bridge.clone(),
        ));

        bridge.subscribe(transport.as_ref()).await?;
        tokio::spawn(bridge.clone().run(transport.messages()));

        info!(
            cmd_prefix = %config.bridge.topics.cmd_prefix,
            evt_prefix = %config.bridge.topics.evt_prefix,
            "Bridge started"
        );

        Ok(Arc::new(Self {
            transport,
            correlator,
            cache,
            bridge,
            config,
        }))
    }

    /// All cached snapshots keyed by topic
    pub async fn snapshots(&self) -> BTreeMap<String, Value> {
        let mut out = BTreeMap::new();
        for topic in self.cache.topics().await {
            if let Some(snapshot) = self.cache.get(&topic).await {
                out.insert(topic, snapshot.to_value());
            }
        }
        out
    }
}
