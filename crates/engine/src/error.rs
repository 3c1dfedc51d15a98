//! Error types for the milestone engine

use thiserror::Error;
use waybill_records::Milestone;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, Error>;

/// Main error type for the milestone engine
#[derive(Debug, Error)]
pub enum Error {
    /// The first milestone recorded for an item must be `CREATED_ISSUED`.
    #[error("First milestone for an item must be CREATED_ISSUED, got {attempted}")]
    InvalidInitialMilestone {
        /// The milestone that was attempted
        attempted: Milestone,
    },

    /// The milestone is already recorded for the item.
    #[error("Milestone {milestone} already recorded for this item")]
    MilestoneAlreadyExists {
        /// The duplicated milestone
        milestone: Milestone,
    },

    /// The attempted milestone is not reachable from the current one.
    #[error("Invalid transition from {current} to {attempted}; valid next milestones: [{allowed}]")]
    InvalidTransition {
        /// The item's current milestone
        current: Milestone,
        /// The milestone that was attempted
        attempted: Milestone,
        /// Comma-separated names of the allowed next milestones
        allowed: String,
    },

    /// The consensus log rejected or failed an operation.
    #[error(transparent)]
    Ledger(#[from] waybill_ledger::Error),

    /// The record store failed.
    #[error("Record store failure: {0}")]
    Records(String),

    /// Payload serialization failed.
    #[error("Payload serialization failed: {0}")]
    Serialize(String),
}

impl Error {
    /// Build an [`Error::InvalidTransition`] naming the allowed set.
    pub fn invalid_transition(
        current: Milestone,
        attempted: Milestone,
        allowed: &[Milestone],
    ) -> Self {
        let allowed = allowed
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        Self::InvalidTransition {
            current,
            attempted,
            allowed,
        }
    }

    /// Wrap a record-store error.
    pub fn records(err: impl std::fmt::Display) -> Self {
        Self::Records(err.to_string())
    }
}
