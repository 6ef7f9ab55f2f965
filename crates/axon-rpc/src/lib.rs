//! Axon RPC - Request/response correlation over pub/sub
//!
//! This crate turns fire-and-forget publishes into awaitable calls:
//! - A pending-request table matched by correlation id, topic and event name
//! - The correlator that publishes commands and enforces per-request timeouts

pub mod correlator;
pub mod pending;

pub use correlator::{
    CorrelatedResponse, Correlator, CorrelatorConfig, CorrelatorError, Request,
    DEFAULT_REQUEST_TIMEOUT,
};
pub use pending::{MatchStrategy, PendingInfo};
