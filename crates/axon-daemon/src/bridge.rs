//! Inbound dispatch loop
//!
//! One task consumes the transport's message stream and reacts to each
//! message in turn: the correlator gets a chance to complete a pending
//! request, attribute reports patch the state cache, and full state reports
//! rebuild device snapshots.

use anyhow::Result;
use axon_core::{
    AttributeValueEntry, Envelope, InboundMessage, MessageKind, QoS, RawDeviceState, Transport,
};
use axon_rpc::{Correlator, MatchStrategy, Request};
use axon_state::StateCache;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;

/// Verb of incremental attribute reports
const REPORT_VERB: &str = "report";

/// Domain of error reports, never an attribute
const ERROR_DOMAIN: &str = "error";

/// Service and command used to request full device state
const STATE_SERVICE: &str = "vinculum";
const STATE_COMMAND: &str = "cmd.pd7.request";

/// What a single inbound message caused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Routed {
    pub malformed: bool,
    pub correlated: Option<MatchStrategy>,
    pub snapshots_replaced: usize,
    pub snapshots_patched: usize,
}

/// Routes inbound traffic to the correlator and the state cache
pub struct Bridge {
    correlator: Arc<Correlator>,
    cache: Arc<StateCache>,
    config: BridgeConfig,
}

impl Bridge {
    pub fn new(correlator: Arc<Correlator>, cache: Arc<StateCache>, config: BridgeConfig) -> Self {
        Self {
            correlator,
            cache,
            config,
        }
    }

    /// Subscribe to everything the bridge consumes
    pub async fn subscribe(&self, transport: &dyn Transport) -> Result<()> {
        let filters = [
            self.config.topics.event_filter(),
            self.config.state_report_topic.clone(),
            self.config.resp_to.clone(),
        ];
        for filter in filters {
            transport.subscribe(&filter, QoS::AtLeastOnce).await?;
        }
        Ok(())
    }

    /// React to one inbound message
    pub async fn handle(&self, msg: &InboundMessage) -> Routed {
        let mut routed = Routed::default();

        let env = match Envelope::from_slice(&msg.payload) {
            Ok(env) => env,
            Err(e) => {
                warn!(topic = %msg.topic, error = %e, "Discarding malformed payload");
                routed.malformed = true;
                return routed;
            }
        };

        routed.correlated = self.correlator.dispatch(&msg.topic, &env);

        if env.msg_type == self.config.state_report_type {
            routed.snapshots_replaced = self.replace_snapshots(&env).await;
        } else if let Some(attribute) = self.report_attribute(&msg.topic, &env) {
            let entry = AttributeValueEntry::from_envelope(&env);
            match self
                .cache
                .apply_attribute_report(&msg.topic, &entry, attribute)
                .await
            {
                Ok(outcome) => routed.snapshots_patched = outcome.published,
                Err(e) => warn!(topic = %msg.topic, attribute = %attribute, error = %e, "Attribute update failed"),
            }
        }

        routed
    }

    /// Attribute name of an incremental report on an event topic
    fn report_attribute<'a>(&self, topic: &str, env: &'a Envelope) -> Option<&'a str> {
        self.config.topics.address_of_event(topic)?;
        let kind = MessageKind::parse(&env.msg_type)?;
        (env.is_event() && kind.verb == REPORT_VERB && kind.domain != ERROR_DOMAIN)
            .then_some(kind.domain)
    }

    async fn replace_snapshots(&self, env: &Envelope) -> usize {
        let devices = match env.val.pointer("/param/state/devices") {
            Some(devices) => devices.clone(),
            None => {
                warn!(msg_type = %env.msg_type, "State report without device list");
                return 0;
            }
        };
        let devices: Vec<RawDeviceState> = match serde_json::from_value(devices) {
            Ok(devices) => devices,
            Err(e) => {
                warn!(error = %e, "Malformed device list in state report");
                return 0;
            }
        };

        let mut replaced = 0;
        for device in &devices {
            let topic = self.config.snapshot_topic(&device.device_key());
            match self.cache.replace_snapshot(&topic, device).await {
                Ok(_) => replaced += 1,
                Err(e) => warn!(topic = %topic, error = %e, "Snapshot replacement failed"),
            }
        }
        info!(devices = devices.len(), replaced, "Processed state report");
        replaced
    }

    /// Ask the controller for a full state report
    ///
    /// The report itself is applied by the dispatch loop when it arrives.
    pub async fn request_state(&self) -> Result<()> {
        let request = Request::new(
            self.config.state_request_address.as_str(),
            STATE_SERVICE,
            STATE_COMMAND,
            json!({"cmd": "get", "component": Value::Null, "param": {"components": ["state"]}}),
        );
        let response = self.correlator.send_request(request).await?;
        debug!(id = %response.id, matched_by = %response.matched_by, "State request answered");
        Ok(())
    }

    /// Consume inbound messages until the transport closes
    pub async fn run(self: Arc<Self>, mut rx: broadcast::Receiver<InboundMessage>) {
        info!("Bridge dispatch loop started");
        loop {
            match rx.recv().await {
                Ok(msg) => {
                    self.handle(&msg).await;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Bridge dispatch loop lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        info!("Bridge dispatch loop stopped");
    }

    /// Periodically request full state so excluded attributes stay fresh
    pub async fn run_state_refresh(self: Arc<Self>) {
        if self.config.state_refresh_secs == 0 {
            info!("Periodic state refresh disabled");
            return;
        }
        let mut ticker = interval(Duration::from_secs(self.config.state_refresh_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            // Runs concurrently with the dispatch loop, which resolves the request
            let bridge = self.clone();
            tokio::spawn(async move {
                if let Err(e) = bridge.request_state().await {
                    warn!(error = %e, "State refresh failed");
                }
            });
        }
    }
}
