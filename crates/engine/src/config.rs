//! Engine configuration

use std::time::Duration;

use waybill_cache::CacheConfig;
use waybill_ledger::ChannelId;

/// Configuration for the reconciliation poller
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Whether polling runs at all
    pub enabled: bool,
    /// Interval between poll ticks
    pub poll_interval: Duration,
    /// Channels polled every tick
    pub channels: Vec<ChannelId>,
    /// Maximum entries requested per channel per tick
    pub read_limit: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: Duration::from_secs(10),
            channels: Vec::new(),
            read_limit: 25,
        }
    }
}

/// Configuration for the real-time fan-out
#[derive(Debug, Clone)]
pub struct FanoutConfig {
    /// Interval between server pings to each open connection
    pub ping_interval: Duration,
    /// Connections with no liveness signal for this long are closed
    pub stale_after: Duration,
    /// Outbound message buffer per subscriber
    pub outbound_buffer: usize,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            stale_after: Duration::from_secs(60),
            outbound_buffer: 64,
        }
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Reconciliation poller settings
    pub sync: SyncConfig,
    /// Fan-out settings
    pub fanout: FanoutConfig,
    /// Ledger read cache settings
    pub cache: CacheConfig,
}
