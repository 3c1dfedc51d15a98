//! Reconciliation poller.
//!
//! Periodically re-reads each configured channel from the consensus log to
//! pick up entries this process did not produce, dedupes by sequence offset
//! with an in-memory cursor per channel, and forwards parsed deltas to the
//! fan-out layer. A second sub-loop on the same cadence announces newly
//! issued items from the channel binding registry.

mod parse;

pub use parse::{ParsedEvent, parse_entry};

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, error, info, warn};
use waybill_cache::ExpiringCache;
use waybill_ledger::{ChannelId, LedgerClient, LedgerEntry, ReadOptions, ReadOrder};
use waybill_records::ChannelBindings;

use crate::config::SyncConfig;
use crate::services::fanout::Fanout;
use crate::wire::{Delta, DeltaKind};

/// Cached result of one `read_since` call, keyed by channel.
///
/// A hit only counts when the cursor has not moved; once it advances the key
/// misses and a fresh remote read happens.
#[derive(Clone, Debug)]
pub struct CachedRead {
    /// Minimum sequence the read was issued with.
    pub min_sequence: u64,
    /// Entries returned, newest first.
    pub entries: Vec<LedgerEntry>,
}

/// Cache fronting consensus-log reads.
pub type ReadCache = ExpiringCache<String, CachedRead>;

/// Per-channel poll position, held in process memory only.
#[derive(Clone, Debug, Default)]
pub struct PollCursor {
    /// Sequence number of the newest entry seen.
    pub last_sequence: u64,
    /// Consensus timestamp of the newest entry seen.
    pub last_timestamp: Option<DateTime<Utc>>,
}

/// The reconciliation poller.
pub struct SyncService<L, B>
where
    L: LedgerClient,
    B: ChannelBindings,
{
    config: SyncConfig,
    ledger: Arc<L>,
    bindings: B,
    fanout: Arc<Fanout>,
    read_cache: ReadCache,
    cursors: RwLock<HashMap<ChannelId, PollCursor>>,
    in_flight: AtomicBool,
    stopped: AtomicBool,
    shutdown: Notify,
}

impl<L, B> SyncService<L, B>
where
    L: LedgerClient,
    B: ChannelBindings,
{
    /// Create a new poller. Loops start with [`SyncService::start`].
    pub fn new(
        config: SyncConfig,
        ledger: Arc<L>,
        bindings: B,
        fanout: Arc<Fanout>,
        read_cache: ReadCache,
    ) -> Self {
        Self {
            config,
            ledger,
            bindings,
            fanout,
            read_cache,
            cursors: RwLock::new(HashMap::new()),
            in_flight: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            shutdown: Notify::new(),
        }
    }

    /// Spawn the channel poll loop and the new-item announce loop.
    pub fn start(self: &Arc<Self>) {
        if !self.config.enabled {
            info!("Reconciliation polling disabled by configuration");
            return;
        }

        // The shutdown future is created once and pinned so the waiter stays
        // registered while a tick body is being awaited; a fresh `notified()`
        // per iteration would drop a notification arriving mid-tick. The flag
        // covers the remaining window before the first registration.
        let poller = self.clone();
        tokio::spawn(async move {
            let shutdown = poller.shutdown.notified();
            tokio::pin!(shutdown);
            let mut interval = tokio::time::interval(poller.config.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                if poller.stopped.load(Ordering::SeqCst) {
                    break;
                }
                tokio::select! {
                    _ = interval.tick() => { poller.force_tick().await; }
                    _ = &mut shutdown => break,
                }
            }
        });

        let announcer = self.clone();
        tokio::spawn(async move {
            let shutdown = announcer.shutdown.notified();
            tokio::pin!(shutdown);
            let mut interval = tokio::time::interval(announcer.config.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                if announcer.stopped.load(Ordering::SeqCst) {
                    break;
                }
                tokio::select! {
                    _ = interval.tick() => announcer.announce_new_items().await,
                    _ = &mut shutdown => break,
                }
            }
        });

        info!(
            "Reconciliation poller started for {} channels, interval {:?}",
            self.config.channels.len(),
            self.config.poll_interval
        );
    }

    /// Stop the loops. A tick already in flight finishes; no further tick
    /// starts afterwards.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();
        info!("Reconciliation poller stopped");
    }

    /// Run one poll tick now, unless one is already in flight.
    ///
    /// Returns whether the tick ran. A skipped tick is logged, not queued.
    pub async fn force_tick(&self) -> bool {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            warn!("Poll tick skipped: previous tick still in flight");
            return false;
        }

        for channel in &self.config.channels {
            // One channel failing must not abort the rest of the tick.
            if let Err(e) = self.poll_channel(channel).await {
                error!("Polling channel {channel} failed: {e}");
            }
        }

        self.in_flight.store(false, Ordering::SeqCst);
        true
    }

    /// Current cursor for a channel, if it has seen any entries.
    pub async fn cursor(&self, channel: &ChannelId) -> Option<PollCursor> {
        self.cursors.read().await.get(channel).cloned()
    }

    async fn poll_channel(&self, channel: &ChannelId) -> Result<(), waybill_ledger::Error> {
        let min_sequence = self
            .cursors
            .read()
            .await
            .get(channel)
            .map_or(1, |cursor| cursor.last_sequence + 1);

        let entries = self.read_entries(channel, min_sequence).await?;
        if entries.is_empty() {
            return Ok(());
        }

        // Entries come newest first; the head is the new cursor position.
        let newest = &entries[0];
        self.cursors.write().await.insert(
            channel.clone(),
            PollCursor {
                last_sequence: newest.sequence_number,
                last_timestamp: Some(newest.consensus_timestamp),
            },
        );
        debug!(
            "Channel {channel}: {} new entries, cursor at {}",
            entries.len(),
            newest.sequence_number
        );

        // Deliver oldest first.
        for entry in entries.iter().rev() {
            self.emit_delta(channel, entry);
        }

        Ok(())
    }

    /// Read through the expiring cache. Repeated reads at an unmoved cursor
    /// are served locally until the entry expires; an advanced cursor misses
    /// and triggers a fresh remote read.
    async fn read_entries(
        &self,
        channel: &ChannelId,
        min_sequence: u64,
    ) -> Result<Vec<LedgerEntry>, waybill_ledger::Error> {
        if let Some(cached) = self.read_cache.get(&channel.to_string()).await {
            if cached.min_sequence == min_sequence {
                return Ok(cached.entries);
            }
        }

        let entries = self
            .ledger
            .read_since(
                channel,
                ReadOptions {
                    min_sequence: Some(min_sequence),
                    limit: self.config.read_limit,
                    order: ReadOrder::Desc,
                },
            )
            .await?;

        self.read_cache
            .set(
                channel.to_string(),
                CachedRead {
                    min_sequence,
                    entries: entries.clone(),
                },
                None,
            )
            .await;

        Ok(entries)
    }

    fn emit_delta(&self, channel: &ChannelId, entry: &LedgerEntry) {
        match parse_entry(&entry.payload) {
            ParsedEvent::Milestone(payload) => {
                let channel_key = payload.item().channel_key();
                let data = json!({
                    "event": payload,
                    "sequenceNumber": entry.sequence_number,
                    "consensusTimestamp": entry.consensus_timestamp,
                });
                self.fanout.publish(&Delta {
                    channel_key,
                    kind: DeltaKind::Milestone,
                    data,
                });
            }
            ParsedEvent::LegacyInvoice(payload) => {
                let channel_key = payload.invoice_id.clone();
                let data = json!({
                    "event": payload,
                    "sequenceNumber": entry.sequence_number,
                    "consensusTimestamp": entry.consensus_timestamp,
                });
                self.fanout.publish(&Delta {
                    channel_key,
                    kind: DeltaKind::LegacyInvoice,
                    data,
                });
            }
            ParsedEvent::Unrecognized => {
                debug!(
                    "Skipping unrecognized entry {} on channel {channel}",
                    entry.sequence_number
                );
            }
        }
    }

    /// Announce items whose channel bindings were created within the recent
    /// lookback window (twice the poll interval), so restarts re-announce at
    /// most one window of items.
    async fn announce_new_items(&self) {
        let bindings = match self.bindings.list_active().await {
            Ok(bindings) => bindings,
            Err(e) => {
                error!("Listing active bindings failed: {e:?}");
                return;
            }
        };

        let window = self.config.poll_interval * 2;
        let cutoff = Utc::now() - chrono::Duration::from_std(window).unwrap_or_default();

        for binding in bindings {
            if binding.created_at < cutoff {
                continue;
            }
            self.fanout.publish(&Delta {
                channel_key: binding.item_key.clone(),
                kind: DeltaKind::ItemIssued,
                data: json!({
                    "itemKey": binding.item_key,
                    "channelId": binding.channel_id,
                    "createdAt": binding.created_at,
                }),
            });
        }
    }
}
