//! Abstract interface to an external append-only consensus log.
//!
//! This is the only seam that crosses the process boundary to the log; every
//! other component depends on [`LedgerClient`] and never on a concrete
//! transport. Payloads are opaque byte blobs serialized by the caller.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-message size cap enforced by the external log.
pub const MAX_MESSAGE_BYTES: usize = 1024;

/// Identifier of one channel (topic) on the consensus log.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(pub String);

impl ChannelId {
    /// View the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Result of creating a channel.
#[derive(Clone, Debug)]
pub struct ChannelInfo {
    /// Id assigned to the new channel.
    pub channel_id: ChannelId,
    /// Transaction that created it.
    pub transaction_id: String,
    /// Consensus timestamp of the creation.
    pub consensus_timestamp: DateTime<Utc>,
}

/// Receipt for one appended message.
#[derive(Clone, Debug)]
pub struct AppendReceipt {
    /// Transaction that carried the append.
    pub transaction_id: String,
    /// Sequence number assigned within the channel, starting at 1.
    pub sequence_number: u64,
    /// Consensus timestamp assigned to the message.
    pub consensus_timestamp: DateTime<Utc>,
}

/// One entry read back from a channel.
#[derive(Clone, Debug)]
pub struct LedgerEntry {
    /// Channel the entry belongs to.
    pub channel_id: ChannelId,
    /// Sequence number within the channel.
    pub sequence_number: u64,
    /// Consensus timestamp of the entry.
    pub consensus_timestamp: DateTime<Utc>,
    /// Opaque payload as appended.
    pub payload: Bytes,
}

/// Ordering of a read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadOrder {
    /// Oldest first.
    Asc,
    /// Newest first.
    Desc,
}

/// Filters for [`LedgerClient::read_since`].
#[derive(Clone, Debug)]
pub struct ReadOptions {
    /// Only return entries with a sequence number at or above this.
    pub min_sequence: Option<u64>,
    /// Maximum number of entries to return.
    pub limit: usize,
    /// Ordering of the returned entries.
    pub order: ReadOrder,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            min_sequence: None,
            limit: 100,
            order: ReadOrder::Asc,
        }
    }
}

/// A client for an external append-only, sequence-numbered consensus log.
#[async_trait]
pub trait LedgerClient: Send + Sync + 'static {
    /// Create a new channel with the given memo.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelCreate`] if the underlying submit fails or the
    /// log does not return a channel id.
    async fn create_channel(&self, memo: &str) -> Result<ChannelInfo, Error>;

    /// Append an opaque payload to a channel.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Append`] on transport failure or when the payload
    /// exceeds [`MAX_MESSAGE_BYTES`].
    async fn append(&self, channel_id: &ChannelId, payload: Bytes)
    -> Result<AppendReceipt, Error>;

    /// Read entries from a channel, newest or oldest first.
    ///
    /// Returns an empty vec (not an error) when no entries match.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Read`] on transport failure.
    async fn read_since(
        &self,
        channel_id: &ChannelId,
        options: ReadOptions,
    ) -> Result<Vec<LedgerEntry>, Error>;

    /// Report whether the log is reachable.
    async fn health(&self) -> bool;
}
