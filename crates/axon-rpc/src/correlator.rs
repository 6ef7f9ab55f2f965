//! Awaitable request/response calls over a pub/sub transport
//!
//! The transport has no notion of a reply. [`Correlator::send_request`]
//! publishes a command envelope, parks the caller on a oneshot slot in the
//! pending table and lets the dispatcher complete it when a matching event
//! arrives, or fails it when the request's timeout elapses first.

use axon_core::{
    Envelope, EnvelopeError, InboundMessage, PublishOptions, TopicScheme, Transport,
    TransportError, ValueType,
};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::pending::{Dispatch, MatchStrategy, PendingInfo, PendingRequest, PendingTable};

/// Default time a request waits for its response
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum CorrelatorError {
    #[error("Request {id} ({service} {command}) timed out after {timeout:?}")]
    Timeout {
        id: String,
        service: String,
        command: String,
        timeout: Duration,
    },
    #[error("Request {id} failed on device (matched by {matched_by}): {detail}")]
    Remote {
        id: String,
        matched_by: MatchStrategy,
        detail: String,
        response: Box<Envelope>,
    },
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Envelope error: {0}")]
    Envelope(#[from] EnvelopeError),
    #[error("Request {0} was dropped before completing")]
    Dropped(String),
}

type Slot = oneshot::Sender<Result<CorrelatedResponse, CorrelatorError>>;

/// Correlator settings
#[derive(Debug, Clone)]
pub struct CorrelatorConfig {
    /// Value of `src` in outgoing envelopes
    pub source: String,
    /// Value of `resp_to` in outgoing envelopes
    pub response_topic: Option<String>,
    pub default_timeout: Duration,
    pub topics: TopicScheme,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            source: "axon".to_string(),
            response_topic: None,
            default_timeout: DEFAULT_REQUEST_TIMEOUT,
            topics: TopicScheme::default(),
        }
    }
}

/// A command to send to one service address
#[derive(Debug, Clone)]
pub struct Request {
    pub address: String,
    pub service: String,
    /// Command type, `cmd.<domain>.<verb>`
    pub command: String,
    pub value: Value,
    pub value_type: ValueType,
    pub props: Map<String, Value>,
    /// Overrides the correlator's default timeout
    pub timeout: Option<Duration>,
}

impl Request {
    pub fn new(
        address: impl Into<String>,
        service: impl Into<String>,
        command: impl Into<String>,
        value: Value,
    ) -> Self {
        let value_type = ValueType::infer(&value);
        Self {
            address: address.into(),
            service: service.into(),
            command: command.into(),
            value,
            value_type,
            props: Map::new(),
            timeout: None,
        }
    }

    pub fn with_value_type(mut self, value_type: ValueType) -> Self {
        self.value_type = value_type;
        self
    }

    pub fn with_props(mut self, props: Map<String, Value>) -> Self {
        self.props = props;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A successful response and how it was matched
#[derive(Debug, Clone, Serialize)]
pub struct CorrelatedResponse {
    /// Correlation id of the request
    pub id: String,
    pub topic: String,
    pub matched_by: MatchStrategy,
    pub message: Envelope,
}

/// Issues correlated requests and resolves them against inbound traffic
pub struct Correlator {
    transport: Arc<dyn Transport>,
    config: CorrelatorConfig,
    pending: Arc<Mutex<PendingTable<Slot>>>,
}

impl Correlator {
    pub fn new(transport: Arc<dyn Transport>, config: CorrelatorConfig) -> Self {
        Self {
            transport,
            config,
            pending: Arc::new(Mutex::new(PendingTable::new())),
        }
    }

    /// Send a command and wait for its response or timeout
    pub async fn send_request(&self, request: Request) -> Result<CorrelatedResponse, CorrelatorError> {
        let timeout = request.timeout.unwrap_or(self.config.default_timeout);
        let command_topic = self.config.topics.command_topic(&request.address);
        let response_topic = self.config.topics.event_topic(&request.address);

        let mut envelope = Envelope::command(
            request.command.as_str(),
            request.service.as_str(),
            request.value,
            request.value_type,
        )
        .with_props(request.props)
        .with_source(self.config.source.as_str());
        if let Some(resp_to) = &self.config.response_topic {
            envelope = envelope.with_response_topic(resp_to.as_str());
        }
        let payload = envelope.to_vec()?;
        let id = envelope.uid.clone();

        let (slot, mut rx) = oneshot::channel();
        let registered = self.lock().insert(PendingRequest {
            id: id.clone(),
            address: request.address.clone(),
            service: request.service.clone(),
            command: request.command.clone(),
            response_topic,
            created_at: Instant::now(),
            timeout,
            slot,
        });
        if !registered {
            // uuid v4 collision; refuse rather than shadow a live request
            return Err(CorrelatorError::Dropped(id));
        }
        let _guard = PendingGuard {
            pending: &self.pending,
            id: id.clone(),
        };

        debug!(
            id = %id,
            topic = %command_topic,
            service = %request.service,
            command = %request.command,
            "Sending request"
        );

        self.transport
            .publish(&command_topic, payload, PublishOptions::default())
            .await?;

        let outcome = tokio::time::timeout(timeout, &mut rx).await;
        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CorrelatorError::Dropped(id)),
            Err(_) => {
                if self.lock().expire(&id).is_some() {
                    warn!(
                        id = %id,
                        service = %request.service,
                        command = %request.command,
                        timeout_ms = timeout.as_millis() as u64,
                        "Request timed out"
                    );
                    return Err(CorrelatorError::Timeout {
                        id,
                        service: request.service,
                        command: request.command,
                        timeout,
                    });
                }
                // The dispatcher took the request just as the timer fired
                rx.await.unwrap_or(Err(CorrelatorError::Dropped(id)))
            }
        }
    }

    /// Offer a raw inbound message; malformed payloads are logged and dropped
    pub fn handle_message(&self, msg: &InboundMessage) -> Option<MatchStrategy> {
        match Envelope::from_slice(&msg.payload) {
            Ok(env) => self.dispatch(&msg.topic, &env),
            Err(e) => {
                warn!(topic = %msg.topic, error = %e, "Discarding malformed payload");
                None
            }
        }
    }

    /// Offer a parsed inbound envelope to the pending requests
    pub fn dispatch(&self, topic: &str, env: &Envelope) -> Option<MatchStrategy> {
        let outcome = self.lock().dispatch(topic, env);

        match outcome {
            Dispatch::Matched(request, strategy) => {
                let elapsed_ms = request.created_at.elapsed().as_millis() as u64;
                let result = if env.is_error_report() && strategy != MatchStrategy::Heuristic {
                    warn!(
                        id = %request.id,
                        matched_by = %strategy,
                        service = %request.service,
                        command = %request.command,
                        "Request rejected by device"
                    );
                    Err(CorrelatorError::Remote {
                        id: request.id.clone(),
                        matched_by: strategy,
                        detail: env.val.to_string(),
                        response: Box::new(env.clone()),
                    })
                } else {
                    debug!(
                        id = %request.id,
                        matched_by = %strategy,
                        response = %env.msg_type,
                        elapsed_ms,
                        "Request completed"
                    );
                    Ok(CorrelatedResponse {
                        id: request.id.clone(),
                        topic: topic.to_string(),
                        matched_by: strategy,
                        message: env.clone(),
                    })
                };
                // The caller may have given up already
                let _ = request.slot.send(result);
                Some(strategy)
            }
            Dispatch::Late(id) => {
                debug!(id = %id, topic = %topic, "Ignoring response to timed-out request");
                None
            }
            Dispatch::Unmatched => {
                trace!(topic = %topic, msg_type = %env.msg_type, "No pending request matches");
                None
            }
        }
    }

    /// Number of requests in flight
    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    pub fn pending(&self) -> Vec<PendingInfo> {
        self.lock().infos()
    }

    /// Dispatch inbound messages in the background
    ///
    /// For callers without their own receive loop. The daemon's bridge calls
    /// [`Correlator::dispatch`] itself and must not run this as well.
    pub fn spawn_dispatcher(self: &Arc<Self>) -> JoinHandle<()> {
        let mut rx = self.transport.messages();
        let correlator = self.clone();
        tokio::spawn(async move {
            info!("Correlator dispatcher started");
            loop {
                match rx.recv().await {
                    Ok(msg) => {
                        correlator.handle_message(&msg);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "Correlator dispatcher lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            info!("Correlator dispatcher stopped");
        })
    }

    fn lock(&self) -> MutexGuard<'_, PendingTable<Slot>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Removes a request from the table when its caller goes away
struct PendingGuard<'a> {
    pending: &'a Mutex<PendingTable<Slot>>,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut table = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if table.remove(&self.id).is_some() {
            debug!(id = %self.id, "Request abandoned before completion");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axon_core::MemoryTransport;
    use serde_json::json;

    const ADDR: &str = "/rt:dev/rn:zw/ad:1/sv:out_lvl_switch/ad:5_0";
    const EVT_TOPIC: &str = "pt:j1/mt:evt/rt:dev/rn:zw/ad:1/sv:out_lvl_switch/ad:5_0";
    const CMD_TOPIC: &str = "pt:j1/mt:cmd/rt:dev/rn:zw/ad:1/sv:out_lvl_switch/ad:5_0";

    fn setup() -> (MemoryTransport, Arc<Correlator>) {
        let transport = MemoryTransport::new();
        let correlator = Arc::new(Correlator::new(
            Arc::new(transport.clone()),
            CorrelatorConfig::default(),
        ));
        correlator.spawn_dispatcher();
        (transport, correlator)
    }

    /// Wait until `n` commands have been published and return their uids
    async fn published_uids(transport: &MemoryTransport, n: usize) -> Vec<String> {
        for _ in 0..200 {
            let published = transport.published();
            if published.len() >= n {
                return published
                    .iter()
                    .map(|m| Envelope::from_slice(&m.payload).unwrap().uid)
                    .collect();
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {} published commands", n);
    }

    fn response(msg_type: &str, serv: &str, corid: Option<&str>) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "type": msg_type,
            "serv": serv,
            "corid": corid,
            "val": 40,
            "val_t": "int",
        }))
        .unwrap()
    }

    fn level_request() -> Request {
        Request::new(ADDR, "out_lvl_switch", "cmd.lvl.set", json!(40))
    }

    #[tokio::test]
    async fn test_command_envelope_published() {
        let (transport, correlator) = setup();
        let call = tokio::spawn({
            let correlator = correlator.clone();
            async move {
                correlator
                    .send_request(level_request().with_timeout(Duration::from_millis(50)))
                    .await
            }
        });

        let uids = published_uids(&transport, 1).await;
        let sent = transport.published();
        assert_eq!(sent[0].topic, CMD_TOPIC);
        assert!(!sent[0].retain);
        let env = Envelope::from_slice(&sent[0].payload).unwrap();
        assert_eq!(env.msg_type, "cmd.lvl.set");
        assert_eq!(env.serv, "out_lvl_switch");
        assert_eq!(env.src, "axon");
        assert_eq!(env.corid, None);
        assert_eq!(env.val_t, ValueType::Int);
        assert_eq!(env.uid, uids[0]);

        assert!(matches!(call.await.unwrap(), Err(CorrelatorError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_id_match_resolves_only_its_call() {
        let (transport, correlator) = setup();
        let mut calls = Vec::new();
        for i in 0..3 {
            let correlator = correlator.clone();
            let address = format!("/rt:dev/rn:zw/ad:1/sv:out_lvl_switch/ad:{}_0", i);
            calls.push(tokio::spawn(async move {
                correlator
                    .send_request(
                        Request::new(address, "out_lvl_switch", "cmd.lvl.get_report", json!(null))
                            .with_timeout(Duration::from_millis(300)),
                    )
                    .await
            }));
        }

        let uids = published_uids(&transport, 3).await;
        let target = uids[1].clone();
        transport.inject("some/other/topic", response("evt.lvl.report", "x", Some(&target)));

        let mut resolved = Vec::new();
        for call in calls {
            resolved.push(call.await.unwrap());
        }
        let ok: Vec<_> = resolved.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(ok.len(), 1);
        assert_eq!(ok[0].id, target);
        assert_eq!(ok[0].matched_by, MatchStrategy::Id);
        assert_eq!(
            resolved.iter().filter(|r| matches!(r, Err(CorrelatorError::Timeout { .. }))).count(),
            2
        );
    }

    #[tokio::test]
    async fn test_topic_match_without_corid() {
        let (transport, correlator) = setup();
        let call = tokio::spawn({
            let correlator = correlator.clone();
            async move { correlator.send_request(level_request()).await }
        });

        published_uids(&transport, 1).await;
        transport.inject(EVT_TOPIC, response("evt.binary.report", "out_lvl_switch", None));

        let response = call.await.unwrap().unwrap();
        assert_eq!(response.matched_by, MatchStrategy::Topic);
        assert_eq!(response.topic, EVT_TOPIC);
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_heuristic_match() {
        let (transport, correlator) = setup();
        let call = tokio::spawn({
            let correlator = correlator.clone();
            async move { correlator.send_request(level_request()).await }
        });

        published_uids(&transport, 1).await;
        transport.inject("pt:j1/mt:evt/rt:dev/rn:zw/ad:1/sv:other/ad:9_0", response("evt.lvl.report", "out_lvl_switch", None));

        let response = call.await.unwrap().unwrap();
        assert_eq!(response.matched_by, MatchStrategy::Heuristic);
        assert_eq!(response.message.val, json!(40));
    }

    #[tokio::test]
    async fn test_error_report_rejects() {
        let (transport, correlator) = setup();
        let by_id = tokio::spawn({
            let correlator = correlator.clone();
            async move { correlator.send_request(level_request()).await }
        });
        let uids = published_uids(&transport, 1).await;
        transport.inject("pt:j1/mt:evt/rt:app/rn:zw/ad:1", response("evt.error.report", "zwave", Some(&uids[0])));

        match by_id.await.unwrap() {
            Err(CorrelatorError::Remote { id, matched_by, .. }) => {
                assert_eq!(id, uids[0]);
                assert_eq!(matched_by, MatchStrategy::Id);
            }
            other => panic!("expected remote error, got {:?}", other),
        }

        let by_topic = tokio::spawn({
            let correlator = correlator.clone();
            async move { correlator.send_request(level_request()).await }
        });
        published_uids(&transport, 2).await;
        transport.inject(EVT_TOPIC, response("evt.error.report", "out_lvl_switch", None));

        assert!(matches!(
            by_topic.await.unwrap(),
            Err(CorrelatorError::Remote { matched_by: MatchStrategy::Topic, .. })
        ));
    }

    #[tokio::test]
    async fn test_timeout_then_late_response() {
        let (_transport, correlator) = setup();
        let result = correlator
            .send_request(level_request().with_timeout(Duration::from_millis(30)))
            .await;

        let id = match result {
            Err(CorrelatorError::Timeout { id, service, command, .. }) => {
                assert_eq!(service, "out_lvl_switch");
                assert_eq!(command, "cmd.lvl.set");
                id
            }
            other => panic!("expected timeout, got {:?}", other),
        };
        assert_eq!(correlator.pending_count(), 0);

        let late = Envelope::from_slice(&response("evt.lvl.report", "out_lvl_switch", Some(&id))).unwrap();
        assert_eq!(correlator.dispatch(EVT_TOPIC, &late), None);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_swallowed() {
        let (transport, correlator) = setup();
        let call = tokio::spawn({
            let correlator = correlator.clone();
            async move { correlator.send_request(level_request()).await }
        });
        published_uids(&transport, 1).await;

        transport.inject(EVT_TOPIC, "{not json");
        transport.inject(EVT_TOPIC, response("evt.lvl.report", "out_lvl_switch", None));

        assert!(call.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_abandoned_request_is_removed() {
        let (transport, correlator) = setup();
        let call = tokio::spawn({
            let correlator = correlator.clone();
            async move { correlator.send_request(level_request()).await }
        });
        published_uids(&transport, 1).await;
        assert_eq!(correlator.pending_count(), 1);

        call.abort();
        let _ = call.await;
        assert_eq!(correlator.pending_count(), 0);
    }
}
