//! Milestone store and state machine.
//!
//! Validates milestone ordering, drives appends to the consensus log, and
//! persists the resulting records. The append is the serialization point for
//! racing writers: validation here reads possibly stale local state, and the
//! loser of a race is revealed by the later reconciliation read rather than
//! prevented synchronously.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;
use waybill_ledger::LedgerClient;
use waybill_records::{
    ChannelBinding, ChannelBindings, ItemKey, Milestone, MilestoneRecord, MilestoneRecords,
};

use crate::error::{EngineResult, Error};
use crate::services::fanout::Fanout;
use crate::services::sync::ReadCache;
use crate::wire::{Delta, DeltaKind, EventContext, MilestonePayload};

/// Milestones reachable from `current`. Authoritative transition graph.
pub const fn valid_next(current: Milestone) -> &'static [Milestone] {
    match current {
        Milestone::CreatedIssued => &[Milestone::Shipped, Milestone::Funded],
        Milestone::Shipped => &[Milestone::CustomsCleared],
        Milestone::CustomsCleared => &[Milestone::Delivered],
        Milestone::Delivered => &[Milestone::Funded, Milestone::Paid],
        Milestone::Funded => &[Milestone::Paid],
        Milestone::Paid => &[],
    }
}

/// Input to [`MilestoneService::publish`].
#[derive(Clone, Debug, Default)]
pub struct NewMilestone {
    /// Hash of the supporting document.
    pub file_hash: Option<String>,
    /// Agent reporting the milestone.
    pub agent_id: Option<String>,
    /// Where the milestone occurred.
    pub location: Option<String>,
    /// Free-form notes.
    pub notes: Option<String>,
    /// Link to the supporting document.
    pub document_url: Option<String>,
    /// Opaque key/value context.
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Validates transitions, appends milestone events to the consensus log, and
/// persists the resulting records.
pub struct MilestoneService<L, R, B>
where
    L: LedgerClient,
    R: MilestoneRecords,
    B: ChannelBindings,
{
    ledger: Arc<L>,
    records: R,
    bindings: B,
    fanout: Arc<Fanout>,
    read_cache: ReadCache,
}

impl<L, R, B> MilestoneService<L, R, B>
where
    L: LedgerClient,
    R: MilestoneRecords,
    B: ChannelBindings,
{
    /// Create a new milestone service.
    pub fn new(
        ledger: Arc<L>,
        records: R,
        bindings: B,
        fanout: Arc<Fanout>,
        read_cache: ReadCache,
    ) -> Self {
        Self {
            ledger,
            records,
            bindings,
            fanout,
            read_cache,
        }
    }

    /// Check that `attempted` is a valid next milestone for `item`.
    ///
    /// Fails with [`Error::InvalidInitialMilestone`] when the item has no
    /// records and `attempted` is not `CreatedIssued`, with
    /// [`Error::MilestoneAlreadyExists`] on a repeat, and with
    /// [`Error::InvalidTransition`] otherwise.
    pub async fn validate_transition(
        &self,
        item: &ItemKey,
        attempted: Milestone,
    ) -> EngineResult<()> {
        let latest = self
            .records
            .find_latest(item)
            .await
            .map_err(Error::records)?;

        let Some(latest) = latest else {
            if attempted == Milestone::CreatedIssued {
                return Ok(());
            }
            return Err(Error::InvalidInitialMilestone { attempted });
        };

        let current = latest.milestone;
        if attempted == current {
            return Err(Error::MilestoneAlreadyExists {
                milestone: attempted,
            });
        }

        let allowed = valid_next(current);
        if !allowed.contains(&attempted) {
            return Err(Error::invalid_transition(current, attempted, allowed));
        }

        Ok(())
    }

    /// Validate, append to the consensus log, persist, and broadcast one
    /// milestone event.
    ///
    /// Validation failures append and persist nothing. Append or persistence
    /// failures after a valid transition are surfaced to the caller; no retry
    /// happens at this layer.
    pub async fn publish(
        &self,
        item: &ItemKey,
        milestone: Milestone,
        details: NewMilestone,
    ) -> EngineResult<MilestoneRecord> {
        self.validate_transition(item, milestone).await?;

        let binding = self.resolve_binding(item).await?;

        let payload = MilestonePayload {
            token_id: item.token_id.clone(),
            serial: item.serial,
            milestone,
            timestamp: Utc::now(),
            file_hash: details.file_hash.clone(),
            context: EventContext {
                agent_id: details.agent_id.clone(),
                location: details.location.clone(),
                notes: details.notes.clone(),
                document_url: details.document_url.clone(),
                metadata: details.metadata.clone(),
            },
        };
        let bytes =
            serde_json::to_vec(&payload).map_err(|e| Error::Serialize(e.to_string()))?;

        let receipt = self
            .ledger
            .append(&binding.channel_id, Bytes::from(bytes))
            .await?;

        let record = MilestoneRecord {
            id: Uuid::new_v4(),
            item: item.clone(),
            milestone,
            channel_id: binding.channel_id.clone(),
            sequence_number: receipt.sequence_number,
            transaction_id: receipt.transaction_id,
            consensus_timestamp: receipt.consensus_timestamp,
            file_hash: details.file_hash,
            agent_id: details.agent_id,
            location: details.location,
            notes: details.notes,
            document_url: details.document_url,
            metadata: details.metadata,
            created_at: Utc::now(),
        };
        let record = self
            .records
            .create(record)
            .await
            .map_err(Error::records)?;

        info!(
            "Recorded {milestone} for {item} at sequence {}",
            record.sequence_number
        );

        // Local readers should not serve the pre-append cached read.
        self.read_cache.delete(&binding.channel_id.to_string()).await;

        // Direct in-process notification; the poller independently rederives
        // the same delta from the log for events produced elsewhere.
        match serde_json::to_value(&record) {
            Ok(data) => self.fanout.publish(&Delta {
                channel_key: item.channel_key(),
                kind: DeltaKind::Milestone,
                data,
            }),
            Err(e) => debug!("Skipping fan-out for {item}: {e}"),
        }

        Ok(record)
    }

    /// The item's most recent milestone, if any.
    pub async fn current_milestone(&self, item: &ItemKey) -> EngineResult<Option<Milestone>> {
        let latest = self
            .records
            .find_latest(item)
            .await
            .map_err(Error::records)?;
        Ok(latest.map(|record| record.milestone))
    }

    /// All milestone records for an item, oldest first.
    pub async fn milestones(&self, item: &ItemKey) -> EngineResult<Vec<MilestoneRecord>> {
        self.records.find_many(item).await.map_err(Error::records)
    }

    /// Milestones that may be recorded next for an item.
    pub async fn next_valid_milestones(&self, item: &ItemKey) -> EngineResult<Vec<Milestone>> {
        match self.current_milestone(item).await? {
            None => Ok(vec![Milestone::CreatedIssued]),
            Some(current) => Ok(valid_next(current).to_vec()),
        }
    }

    /// Percentage of milestone types recorded for an item, rounded.
    pub async fn progress(&self, item: &ItemKey) -> EngineResult<u8> {
        let recorded = self.milestones(item).await?.len();
        let total = Milestone::ALL.len();
        let percent = (100.0 * recorded as f64 / total as f64).round() as u8;
        Ok(percent)
    }

    /// Drop cached consensus-log reads for the item's channel.
    pub async fn clear_cache(&self, item: &ItemKey) -> EngineResult<()> {
        let binding = self
            .bindings
            .find_by_item_key(&item.channel_key())
            .await
            .map_err(Error::records)?;
        if let Some(binding) = binding {
            self.read_cache.delete(&binding.channel_id.to_string()).await;
        }
        Ok(())
    }

    /// Whether the consensus log is reachable.
    pub async fn health_check(&self) -> bool {
        self.ledger.health().await
    }

    /// Resolve the item's channel binding, creating channel and binding on
    /// first write.
    async fn resolve_binding(&self, item: &ItemKey) -> EngineResult<ChannelBinding> {
        let key = item.channel_key();
        if let Some(binding) = self
            .bindings
            .find_by_item_key(&key)
            .await
            .map_err(Error::records)?
        {
            return Ok(binding);
        }

        let info = self
            .ledger
            .create_channel(&format!("waybill:{key}"))
            .await?;
        info!("Created channel {} for {key}", info.channel_id);

        self.bindings
            .create(ChannelBinding {
                item_key: key,
                channel_id: info.channel_id,
                is_active: true,
                created_at: Utc::now(),
            })
            .await
            .map_err(Error::records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use waybill_cache::{CacheConfig, ExpiringCache};
    use waybill_ledger_memory::MemoryLedger;
    use waybill_records_memory::{MemoryBindings, MemoryRecords};

    use crate::config::FanoutConfig;

    type Service = MilestoneService<MemoryLedger, MemoryRecords, MemoryBindings>;

    fn service() -> (Service, Arc<MemoryLedger>) {
        let ledger = Arc::new(MemoryLedger::new());
        let fanout = Arc::new(Fanout::new(FanoutConfig::default()));
        let cache = ExpiringCache::new(CacheConfig::default());
        let service = MilestoneService::new(
            ledger.clone(),
            MemoryRecords::new(),
            MemoryBindings::new(),
            fanout,
            cache,
        );
        (service, ledger)
    }

    fn item() -> ItemKey {
        ItemKey::new("0.0.123", 1)
    }

    #[tokio::test]
    async fn test_first_milestone_must_be_created_issued() {
        let (service, _) = service();

        let err = service
            .publish(&item(), Milestone::Shipped, NewMilestone::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInitialMilestone { .. }));

        // Nothing was persisted or appended.
        assert!(service.milestones(&item()).await.unwrap().is_empty());

        service
            .publish(&item(), Milestone::CreatedIssued, NewMilestone::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_milestone_rejected() {
        let (service, _) = service();
        service
            .publish(&item(), Milestone::CreatedIssued, NewMilestone::default())
            .await
            .unwrap();

        let err = service
            .publish(&item(), Milestone::CreatedIssued, NewMilestone::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MilestoneAlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_invalid_transition_names_current_and_allowed() {
        let (service, _) = service();
        service
            .publish(&item(), Milestone::CreatedIssued, NewMilestone::default())
            .await
            .unwrap();
        service
            .publish(&item(), Milestone::Shipped, NewMilestone::default())
            .await
            .unwrap();

        let err = service
            .publish(&item(), Milestone::Paid, NewMilestone::default())
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("SHIPPED"));
        assert!(message.contains("PAID"));
        assert!(message.contains("CUSTOMS_CLEARED"));
    }

    #[tokio::test]
    async fn test_full_happy_path_assigns_sequence_numbers() {
        let (service, _) = service();
        let item = item();

        let steps = [
            Milestone::CreatedIssued,
            Milestone::Shipped,
            Milestone::CustomsCleared,
            Milestone::Delivered,
            Milestone::Funded,
            Milestone::Paid,
        ];
        for (i, milestone) in steps.iter().enumerate() {
            let record = service
                .publish(&item, *milestone, NewMilestone::default())
                .await
                .unwrap();
            assert_eq!(record.sequence_number, i as u64 + 1);
        }

        assert_eq!(service.progress(&item).await.unwrap(), 100);
        assert!(service.next_valid_milestones(&item).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_next_valid_milestones() {
        let (service, _) = service();
        let item = item();

        assert_eq!(
            service.next_valid_milestones(&item).await.unwrap(),
            vec![Milestone::CreatedIssued]
        );

        service
            .publish(&item, Milestone::CreatedIssued, NewMilestone::default())
            .await
            .unwrap();
        assert_eq!(
            service.next_valid_milestones(&item).await.unwrap(),
            vec![Milestone::Shipped, Milestone::Funded]
        );
    }

    #[tokio::test]
    async fn test_progress_rounding() {
        let (service, _) = service();
        let item = item();

        assert_eq!(service.progress(&item).await.unwrap(), 0);

        service
            .publish(&item, Milestone::CreatedIssued, NewMilestone::default())
            .await
            .unwrap();
        assert_eq!(service.progress(&item).await.unwrap(), 17);

        service
            .publish(&item, Milestone::Shipped, NewMilestone::default())
            .await
            .unwrap();
        assert_eq!(service.progress(&item).await.unwrap(), 33);
    }

    #[tokio::test]
    async fn test_append_failure_persists_nothing() {
        let (service, ledger) = service();
        let item = item();
        service
            .publish(&item, Milestone::CreatedIssued, NewMilestone::default())
            .await
            .unwrap();

        ledger.set_healthy(false);
        let err = service
            .publish(&item, Milestone::Shipped, NewMilestone::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Ledger(_)));

        // Valid transition, but the failed append left no record behind.
        assert_eq!(service.milestones(&item).await.unwrap().len(), 1);
        assert!(!service.health_check().await);
    }

    #[tokio::test]
    async fn test_channel_created_lazily_once() {
        let (service, _) = service();
        let item = item();

        service
            .publish(&item, Milestone::CreatedIssued, NewMilestone::default())
            .await
            .unwrap();
        service
            .publish(&item, Milestone::Shipped, NewMilestone::default())
            .await
            .unwrap();

        let records = service.milestones(&item).await.unwrap();
        assert_eq!(records[0].channel_id, records[1].channel_id);
    }
}
