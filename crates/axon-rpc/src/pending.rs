//! Pending request table and response matching
//!
//! One table per correlator holds every in-flight request. Inbound messages
//! are matched against it in priority order:
//! 1. exact correlation id (direct lookup)
//! 2. response topic (scan in registration order)
//! 3. event-name heuristic (scan in registration order)
//!
//! An inbound message resolves at most one request. When several requests
//! could take the same message by topic or heuristic, the oldest wins.

use axon_core::{Envelope, MessageKind};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

/// Number of timed-out ids remembered to recognise late responses
const EXPIRED_CAPACITY: usize = 256;

/// Verb a device may answer any `set` command with
const SET_VERB: &str = "set";
const REPORT_VERB: &str = "report";

/// Which rule matched a response to its request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchStrategy {
    Id,
    Topic,
    Heuristic,
}

impl fmt::Display for MatchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Id => "id",
            Self::Topic => "topic",
            Self::Heuristic => "heuristic",
        };
        f.write_str(name)
    }
}

/// A request awaiting its response
#[derive(Debug)]
pub struct PendingRequest<S> {
    pub id: String,
    pub address: String,
    pub service: String,
    pub command: String,
    /// Event-namespace topic the response is expected on
    pub response_topic: String,
    pub created_at: Instant,
    pub timeout: Duration,
    /// Completion slot, fired once
    pub slot: S,
}

impl<S> PendingRequest<S> {
    /// Whether an event matches this request by name alone
    pub fn matches_heuristically(&self, env: &Envelope) -> bool {
        if !env.is_event() {
            return false;
        }
        let (Some(inbound), Some(request)) = (
            MessageKind::parse(&env.msg_type),
            MessageKind::parse(&self.command),
        ) else {
            return false;
        };
        if inbound.domain != request.domain {
            return false;
        }
        let verb_matches = self.command.ends_with(inbound.verb)
            || (request.verb == SET_VERB && inbound.verb == REPORT_VERB);
        verb_matches && env.serv == self.service
    }
}

/// Read-only view of a pending request
#[derive(Debug, Clone, Serialize)]
pub struct PendingInfo {
    pub id: String,
    pub address: String,
    pub service: String,
    pub command: String,
    pub age_ms: u64,
    pub timeout_ms: u64,
}

/// Outcome of offering an inbound message to the table
#[derive(Debug)]
pub enum Dispatch<S> {
    /// The message completes this request
    Matched(PendingRequest<S>, MatchStrategy),
    /// The message answers a request that already timed out
    Late(String),
    /// Nothing pending matches
    Unmatched,
}

/// In-flight requests, indexed by id and ordered by registration
#[derive(Debug)]
pub struct PendingTable<S> {
    by_seq: BTreeMap<u64, PendingRequest<S>>,
    index: HashMap<String, u64>,
    expired: VecDeque<String>,
    expired_set: HashSet<String>,
    next_seq: u64,
}

impl<S> Default for PendingTable<S> {
    fn default() -> Self {
        Self {
            by_seq: BTreeMap::new(),
            index: HashMap::new(),
            expired: VecDeque::new(),
            expired_set: HashSet::new(),
            next_seq: 0,
        }
    }
}

impl<S> PendingTable<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request; returns false if the id is already in flight
    pub fn insert(&mut self, request: PendingRequest<S>) -> bool {
        if self.index.contains_key(&request.id) {
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.index.insert(request.id.clone(), seq);
        self.by_seq.insert(seq, request);
        true
    }

    pub fn remove(&mut self, id: &str) -> Option<PendingRequest<S>> {
        let seq = self.index.remove(id)?;
        self.by_seq.remove(&seq)
    }

    /// Remove a timed-out request and remember its id
    pub fn expire(&mut self, id: &str) -> Option<PendingRequest<S>> {
        let request = self.remove(id)?;
        if self.expired.len() == EXPIRED_CAPACITY {
            if let Some(oldest) = self.expired.pop_front() {
                self.expired_set.remove(&oldest);
            }
        }
        self.expired.push_back(id.to_string());
        self.expired_set.insert(id.to_string());
        Some(request)
    }

    pub fn len(&self) -> usize {
        self.by_seq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_seq.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn infos(&self) -> Vec<PendingInfo> {
        self.by_seq
            .values()
            .map(|r| PendingInfo {
                id: r.id.clone(),
                address: r.address.clone(),
                service: r.service.clone(),
                command: r.command.clone(),
                age_ms: r.created_at.elapsed().as_millis() as u64,
                timeout_ms: r.timeout.as_millis() as u64,
            })
            .collect()
    }

    /// Match an inbound message and take the request it completes
    ///
    /// A correlation id naming a timed-out request never revives it, but the
    /// message may still answer a live request by topic or heuristic.
    pub fn dispatch(&mut self, topic: &str, env: &Envelope) -> Dispatch<S> {
        let mut late = None;
        if let Some(corid) = env.correlation_id() {
            if let Some(request) = self.remove(corid) {
                return Dispatch::Matched(request, MatchStrategy::Id);
            }
            if self.expired_set.contains(corid) {
                late = Some(corid.to_string());
            }
        }

        let by_topic = self
            .by_seq
            .iter()
            .find(|(_, r)| r.response_topic == topic)
            .map(|(seq, _)| (*seq, MatchStrategy::Topic));

        let found = by_topic.or_else(|| {
            self.by_seq
                .iter()
                .find(|(_, r)| r.matches_heuristically(env))
                .map(|(seq, _)| (*seq, MatchStrategy::Heuristic))
        });

        match found.and_then(|(seq, strategy)| self.by_seq.remove(&seq).map(|r| (r, strategy))) {
            Some((request, strategy)) => {
                self.index.remove(&request.id);
                Dispatch::Matched(request, strategy)
            }
            None => late.map_or(Dispatch::Unmatched, Dispatch::Late),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ADDR: &str = "/rt:dev/rn:zw/ad:1/sv:out_lvl_switch/ad:5_0";

    fn request(id: &str, command: &str, service: &str) -> PendingRequest<()> {
        PendingRequest {
            id: id.to_string(),
            address: ADDR.to_string(),
            service: service.to_string(),
            command: command.to_string(),
            response_topic: format!("pt:j1/mt:evt{}", ADDR),
            created_at: Instant::now(),
            timeout: Duration::from_secs(10),
            slot: (),
        }
    }

    fn event(msg_type: &str, serv: &str, corid: Option<&str>) -> Envelope {
        serde_json::from_value(json!({
            "type": msg_type,
            "serv": serv,
            "corid": corid,
            "val": null,
        }))
        .unwrap()
    }

    fn matched(dispatch: Dispatch<()>) -> Option<(String, MatchStrategy)> {
        match dispatch {
            Dispatch::Matched(r, s) => Some((r.id, s)),
            _ => None,
        }
    }

    #[test]
    fn test_id_match_takes_only_that_request() {
        let mut table = PendingTable::new();
        for id in ["a", "b", "c"] {
            assert!(table.insert(request(id, "cmd.lvl.set", "out_lvl_switch")));
        }

        let env = event("evt.lvl.report", "out_lvl_switch", Some("b"));
        let result = matched(table.dispatch("unrelated/topic", &env));

        assert_eq!(result, Some(("b".to_string(), MatchStrategy::Id)));
        assert!(table.contains("a"));
        assert!(table.contains("c"));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut table = PendingTable::new();
        assert!(table.insert(request("a", "cmd.lvl.set", "out_lvl_switch")));
        assert!(!table.insert(request("a", "cmd.lvl.set", "out_lvl_switch")));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_topic_match_oldest_first() {
        let mut table = PendingTable::new();
        table.insert(request("first", "cmd.binary.set", "out_bin_switch"));
        table.insert(request("second", "cmd.binary.set", "out_bin_switch"));

        let env = event("evt.something.else", "other", None);
        let topic = format!("pt:j1/mt:evt{}", ADDR);
        assert_eq!(
            matched(table.dispatch(&topic, &env)),
            Some(("first".to_string(), MatchStrategy::Topic))
        );
        assert_eq!(
            matched(table.dispatch(&topic, &env)),
            Some(("second".to_string(), MatchStrategy::Topic))
        );
        assert!(table.is_empty());
    }

    #[test]
    fn test_heuristic_rules() {
        let set = request("a", "cmd.lvl.set", "out_lvl_switch");
        assert!(set.matches_heuristically(&event("evt.lvl.report", "out_lvl_switch", None)));
        assert!(!set.matches_heuristically(&event("evt.lvl.report", "other_service", None)));
        assert!(!set.matches_heuristically(&event("evt.binary.report", "out_lvl_switch", None)));
        assert!(!set.matches_heuristically(&event("cmd.lvl.report", "out_lvl_switch", None)));
        assert!(!set.matches_heuristically(&event("evt.lvl.report.x", "out_lvl_switch", None)));

        let get = request("b", "cmd.state.get_report", "thermostat");
        assert!(get.matches_heuristically(&event("evt.state.report", "thermostat", None)));
        assert!(!get.matches_heuristically(&event("evt.state.changed", "thermostat", None)));
    }

    #[test]
    fn test_late_response_is_recognised() {
        let mut table = PendingTable::new();
        table.insert(request("gone", "cmd.lvl.set", "out_lvl_switch"));
        table.insert(request("other", "cmd.binary.set", "out_bin_switch"));
        assert!(table.expire("gone").is_some());

        let env = event("evt.lvl.report", "out_lvl_switch", Some("gone"));
        assert!(matches!(table.dispatch("x", &env), Dispatch::Late(id) if id == "gone"));
        assert!(table.contains("other"));
        assert!(!table.contains("gone"));
    }

    #[test]
    fn test_late_id_still_answers_live_request_by_topic() {
        let mut table = PendingTable::new();
        table.insert(request("old", "cmd.lvl.set", "out_lvl_switch"));
        assert!(table.expire("old").is_some());
        table.insert(request("live", "cmd.lvl.set", "out_lvl_switch"));

        let env = event("evt.lvl.report", "out_lvl_switch", Some("old"));
        let topic = format!("pt:j1/mt:evt{}", ADDR);
        assert_eq!(
            matched(table.dispatch(&topic, &env)),
            Some(("live".to_string(), MatchStrategy::Topic))
        );
        assert!(table.is_empty());
    }

    #[test]
    fn test_heuristic_match_oldest_first() {
        let mut table = PendingTable::new();
        table.insert(request("first", "cmd.lvl.set", "out_lvl_switch"));
        table.insert(request("second", "cmd.lvl.set", "out_lvl_switch"));

        let env = event("evt.lvl.report", "out_lvl_switch", None);
        assert_eq!(
            matched(table.dispatch("unrelated/topic", &env)),
            Some(("first".to_string(), MatchStrategy::Heuristic))
        );
        assert!(!table.contains("first"));
        assert!(table.contains("second"));
    }

    #[test]
    fn test_unknown_corid_falls_back() {
        let mut table = PendingTable::new();
        table.insert(request("a", "cmd.lvl.set", "out_lvl_switch"));

        let env = event("evt.lvl.report", "out_lvl_switch", Some("foreign"));
        assert_eq!(
            matched(table.dispatch("x", &env)),
            Some(("a".to_string(), MatchStrategy::Heuristic))
        );
    }

    #[test]
    fn test_no_match() {
        let mut table = PendingTable::new();
        table.insert(request("a", "cmd.lvl.set", "out_lvl_switch"));
        let env = event("evt.sensor.report", "sensor_temp", None);
        assert!(matches!(table.dispatch("x", &env), Dispatch::Unmatched));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_expired_ids_are_bounded() {
        let mut table = PendingTable::new();
        for i in 0..(EXPIRED_CAPACITY + 10) {
            let id = format!("r{}", i);
            table.insert(request(&id, "cmd.lvl.set", "s"));
            table.expire(&id);
        }
        assert_eq!(table.expired.len(), EXPIRED_CAPACITY);
        assert!(!table.expired_set.contains("r0"));
        assert!(table.expired_set.contains(&format!("r{}", EXPIRED_CAPACITY + 9)));
    }
}
