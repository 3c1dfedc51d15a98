//! Milestone synchronization engine for tradeable documents.
//!
//! Tracks items through a fixed sequence of business milestones, anchors each
//! milestone on an external append-only consensus log, and keeps subscribed
//! clients synchronized with that log in near-real-time:
//!
//! - a state machine enforcing valid milestone ordering
//!   ([`services::milestones`]),
//! - a write path that appends normalized events to the log and records them
//!   locally,
//! - a reconciliation poller that re-reads the log per channel, dedupes by
//!   sequence offset, and derives deltas ([`services::sync`]),
//! - a WebSocket fan-out pushing those deltas to subscribers
//!   ([`services::fanout`]).
//!
//! The engine is constructed from its collaborators (a [`LedgerClient`]
//! implementation and the record stores) and owns its background loops,
//! started and stopped explicitly.

mod engine;

pub mod config;
pub mod error;
pub mod services;
pub mod wire;

pub use config::{EngineConfig, FanoutConfig, SyncConfig};
pub use engine::Engine;
pub use error::{EngineResult, Error};
pub use services::fanout::{Fanout, FanoutStats};
pub use services::milestones::{MilestoneService, NewMilestone, valid_next};
pub use services::sync::{ParsedEvent, PollCursor, SyncService, parse_entry};
pub use waybill_ledger::LedgerClient;
pub use waybill_records::{ItemKey, Milestone, MilestoneRecord};
