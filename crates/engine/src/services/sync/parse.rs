//! Parsing of polled consensus-log payloads.
//!
//! Everything read back from a channel goes through [`parse_entry`], which
//! produces a tagged event so downstream code matches exhaustively instead of
//! probing fields. Malformed payloads come back as `Unrecognized` and are
//! skipped by the poller, never fatal.

use crate::wire::{LegacyInvoicePayload, MilestonePayload};

/// A polled payload, classified.
#[derive(Clone, Debug)]
pub enum ParsedEvent {
    /// A normalized milestone event.
    Milestone(MilestonePayload),
    /// An invoice status event written by the previous producer generation.
    LegacyInvoice(LegacyInvoicePayload),
    /// Anything else: malformed JSON or an unknown shape.
    Unrecognized,
}

/// Classify one raw payload.
pub fn parse_entry(payload: &[u8]) -> ParsedEvent {
    if let Ok(event) = serde_json::from_slice::<MilestonePayload>(payload) {
        return ParsedEvent::Milestone(event);
    }
    if let Ok(event) = serde_json::from_slice::<LegacyInvoicePayload>(payload) {
        return ParsedEvent::LegacyInvoice(event);
    }
    ParsedEvent::Unrecognized
}
