//! Axon State - Consolidated per-device state documents
//!
//! Keeps the last published snapshot for every device topic, rebuilds it from
//! full state reports and patches single attributes from incremental reports.

pub mod cache;

pub use cache::{CacheConfig, CacheError, PatchOutcome, StateCache};
