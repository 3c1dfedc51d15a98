//! In-memory (single process) consensus log for local development and tests.
//!
//! Channels are plain vectors behind a lock; sequence numbers are assigned
//! monotonically per channel starting at 1, matching the external log's
//! numbering.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;
use waybill_ledger::{
    AppendReceipt, ChannelId, ChannelInfo, Error, LedgerClient, LedgerEntry, MAX_MESSAGE_BYTES,
    ReadOptions, ReadOrder,
};

/// In-memory consensus log.
#[derive(Clone, Default)]
pub struct MemoryLedger {
    channels: Arc<Mutex<HashMap<ChannelId, Vec<LedgerEntry>>>>,
    next_channel: Arc<AtomicU64>,
    unhealthy: Arc<AtomicBool>,
}

impl MemoryLedger {
    /// Creates a new `MemoryLedger`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
            next_channel: Arc::new(AtomicU64::new(1000)),
            unhealthy: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Force `health()` to report the given state. Test hook.
    pub fn set_healthy(&self, healthy: bool) {
        self.unhealthy.store(!healthy, Ordering::SeqCst);
    }

    fn transaction_id() -> String {
        format!("0.0.2@{}", Uuid::new_v4())
    }
}

#[async_trait]
impl LedgerClient for MemoryLedger {
    async fn create_channel(&self, _memo: &str) -> Result<ChannelInfo, Error> {
        if self.unhealthy.load(Ordering::SeqCst) {
            return Err(Error::ChannelCreate("ledger unavailable".to_string()));
        }

        let n = self.next_channel.fetch_add(1, Ordering::SeqCst);
        let channel_id = ChannelId(format!("0.0.{n}"));

        self.channels
            .lock()
            .await
            .insert(channel_id.clone(), Vec::new());

        Ok(ChannelInfo {
            channel_id,
            transaction_id: Self::transaction_id(),
            consensus_timestamp: Utc::now(),
        })
    }

    async fn append(
        &self,
        channel_id: &ChannelId,
        payload: Bytes,
    ) -> Result<AppendReceipt, Error> {
        if self.unhealthy.load(Ordering::SeqCst) {
            return Err(Error::Append("ledger unavailable".to_string()));
        }
        if payload.len() > MAX_MESSAGE_BYTES {
            return Err(Error::Append(format!(
                "payload of {} bytes exceeds the {MAX_MESSAGE_BYTES} byte message limit",
                payload.len()
            )));
        }

        let mut channels = self.channels.lock().await;
        let entries = channels
            .get_mut(channel_id)
            .ok_or_else(|| Error::UnknownChannel(channel_id.to_string()))?;

        let entry = LedgerEntry {
            channel_id: channel_id.clone(),
            sequence_number: entries.len() as u64 + 1,
            consensus_timestamp: Utc::now(),
            payload,
        };
        let receipt = AppendReceipt {
            transaction_id: Self::transaction_id(),
            sequence_number: entry.sequence_number,
            consensus_timestamp: entry.consensus_timestamp,
        };
        entries.push(entry);

        Ok(receipt)
    }

    async fn read_since(
        &self,
        channel_id: &ChannelId,
        options: ReadOptions,
    ) -> Result<Vec<LedgerEntry>, Error> {
        if self.unhealthy.load(Ordering::SeqCst) {
            return Err(Error::Read("ledger unavailable".to_string()));
        }

        let channels = self.channels.lock().await;
        let Some(entries) = channels.get(channel_id) else {
            // Unknown channels read as empty rather than failing; the poller
            // treats configured-but-not-yet-created channels as quiet.
            return Ok(Vec::new());
        };

        let min = options.min_sequence.unwrap_or(0);
        let mut matched: Vec<LedgerEntry> = entries
            .iter()
            .filter(|entry| entry.sequence_number >= min)
            .cloned()
            .collect();

        if options.order == ReadOrder::Desc {
            matched.reverse();
        }
        matched.truncate(options.limit);

        Ok(matched)
    }

    async fn health(&self) -> bool {
        !self.unhealthy.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_assigns_sequence_numbers() {
        let ledger = MemoryLedger::new();
        let info = ledger.create_channel("test").await.unwrap();

        let first = ledger
            .append(&info.channel_id, Bytes::from_static(b"one"))
            .await
            .unwrap();
        let second = ledger
            .append(&info.channel_id, Bytes::from_static(b"two"))
            .await
            .unwrap();

        assert_eq!(first.sequence_number, 1);
        assert_eq!(second.sequence_number, 2);
    }

    #[tokio::test]
    async fn test_read_since_filters_and_orders() {
        let ledger = MemoryLedger::new();
        let info = ledger.create_channel("test").await.unwrap();
        for body in [&b"a"[..], b"b", b"c"] {
            ledger
                .append(&info.channel_id, Bytes::copy_from_slice(body))
                .await
                .unwrap();
        }

        let newest_first = ledger
            .read_since(
                &info.channel_id,
                ReadOptions {
                    min_sequence: Some(2),
                    limit: 10,
                    order: ReadOrder::Desc,
                },
            )
            .await
            .unwrap();

        let sequences: Vec<u64> = newest_first.iter().map(|e| e.sequence_number).collect();
        assert_eq!(sequences, vec![3, 2]);
    }

    #[tokio::test]
    async fn test_read_past_end_is_empty_not_error() {
        let ledger = MemoryLedger::new();
        let info = ledger.create_channel("test").await.unwrap();

        let entries = ledger
            .read_since(
                &info.channel_id,
                ReadOptions {
                    min_sequence: Some(5),
                    ..ReadOptions::default()
                },
            )
            .await
            .unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_oversize_append_rejected() {
        let ledger = MemoryLedger::new();
        let info = ledger.create_channel("test").await.unwrap();

        let oversize = Bytes::from(vec![0u8; MAX_MESSAGE_BYTES + 1]);
        let result = ledger.append(&info.channel_id, oversize).await;
        assert!(matches!(result, Err(Error::Append(_))));
    }

    #[tokio::test]
    async fn test_unhealthy_ledger_fails_appends() {
        let ledger = MemoryLedger::new();
        let info = ledger.create_channel("test").await.unwrap();

        ledger.set_healthy(false);
        assert!(!ledger.health().await);
        assert!(
            ledger
                .append(&info.channel_id, Bytes::from_static(b"x"))
                .await
                .is_err()
        );
    }
}
