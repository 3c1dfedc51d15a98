//! Engine assembly.
//!
//! Wires the milestone service, reconciliation poller, fan-out registry, and
//! read cache together with a single start/stop lifecycle. Everything is
//! explicitly constructed and passed by reference; there is no global state.

use std::sync::Arc;

use tracing::info;
use waybill_cache::ExpiringCache;
use waybill_ledger::LedgerClient;
use waybill_records::{ChannelBindings, MilestoneRecords};

use crate::config::EngineConfig;
use crate::services::fanout::Fanout;
use crate::services::milestones::MilestoneService;
use crate::services::sync::{ReadCache, SyncService};

/// The milestone synchronization engine.
pub struct Engine<L, R, B>
where
    L: LedgerClient,
    R: MilestoneRecords,
    B: ChannelBindings,
{
    ledger: Arc<L>,
    milestones: MilestoneService<L, R, B>,
    sync: Arc<SyncService<L, B>>,
    fanout: Arc<Fanout>,
    read_cache: ReadCache,
}

impl<L, R, B> Engine<L, R, B>
where
    L: LedgerClient,
    R: MilestoneRecords,
    B: ChannelBindings,
{
    /// Build an engine from its collaborators.
    ///
    /// Must be called from within a tokio runtime; background loops start
    /// with [`Engine::start`].
    pub fn new(config: EngineConfig, ledger: L, records: R, bindings: B) -> Self {
        let ledger = Arc::new(ledger);
        let fanout = Arc::new(Fanout::new(config.fanout));
        let read_cache: ReadCache = ExpiringCache::new(config.cache);

        let milestones = MilestoneService::new(
            ledger.clone(),
            records,
            bindings.clone(),
            fanout.clone(),
            read_cache.clone(),
        );
        let sync = Arc::new(SyncService::new(
            config.sync,
            ledger.clone(),
            bindings,
            fanout.clone(),
            read_cache.clone(),
        ));

        Self {
            ledger,
            milestones,
            sync,
            fanout,
            read_cache,
        }
    }

    /// Start all background loops: fan-out ping/cleanup and the poller.
    pub fn start(&self) {
        self.fanout.start();
        self.sync.start();
        info!("Waybill engine started");
    }

    /// Stop all background loops, close all fan-out connections, and drop
    /// the read cache.
    pub async fn stop(&self) {
        self.sync.stop();
        self.fanout.stop();
        self.read_cache.destroy().await;
        info!("Waybill engine stopped");
    }

    /// Mount the fan-out WebSocket endpoint into an axum router.
    pub fn mount_into_router(&self, router: axum::Router, path: &str) -> axum::Router {
        self.fanout.mount_into_router(router, path)
    }

    /// Whether the consensus log is reachable.
    pub async fn health_check(&self) -> bool {
        self.ledger.health().await
    }

    /// The milestone write/query service.
    pub fn milestones(&self) -> &MilestoneService<L, R, B> {
        &self.milestones
    }

    /// The reconciliation poller.
    pub fn sync(&self) -> &Arc<SyncService<L, B>> {
        &self.sync
    }

    /// The fan-out registry.
    pub fn fanout(&self) -> &Arc<Fanout> {
        &self.fanout
    }
}
