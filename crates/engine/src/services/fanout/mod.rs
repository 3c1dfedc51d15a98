//! Real-time fan-out of domain deltas to subscribed clients.
//!
//! Delivery is best-effort and at-most-once: a failed send removes the
//! subscriber, nothing is buffered for disconnected clients.

mod ws;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use serde_json::json;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::FanoutConfig;
use crate::wire::{Delta, ServerMessage};

/// One connected subscriber.
struct Subscriber {
    /// Outbound queue; the transport task drains it onto the socket.
    sender: mpsc::Sender<ServerMessage>,
    /// Channel keys the subscriber asked for. Empty set means firehose:
    /// the subscriber receives every delta.
    subscriptions: HashSet<String>,
    /// Last time the subscriber was observed alive: a pong, a client ping or
    /// a completed socket write, never a mere queue accept.
    last_seen: Instant,
}

/// Fan-out statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanoutStats {
    /// Connected subscribers.
    pub total_clients: usize,
    /// Subscribers observed alive within the stale threshold.
    pub active_clients: usize,
    /// Sum of subscription set sizes across subscribers.
    pub total_subscriptions: usize,
}

/// Subscriber registry and delta router.
pub struct Fanout {
    config: FanoutConfig,
    clients: DashMap<Uuid, Subscriber>,
    stopped: AtomicBool,
    shutdown: Notify,
}

impl Fanout {
    /// Create a new fan-out registry. Background loops start with
    /// [`Fanout::start`].
    pub fn new(config: FanoutConfig) -> Self {
        Self {
            config,
            clients: DashMap::new(),
            stopped: AtomicBool::new(false),
            shutdown: Notify::new(),
        }
    }

    /// Spawn the ping and stale-cleanup loops.
    pub fn start(self: &Arc<Self>) {
        // The shutdown future is pinned outside the loop so its waiter stays
        // registered across iterations; the flag covers the window before the
        // first registration.
        let ping = self.clone();
        tokio::spawn(async move {
            let shutdown = ping.shutdown.notified();
            tokio::pin!(shutdown);
            let mut interval = tokio::time::interval(ping.config.ping_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                if ping.stopped.load(Ordering::SeqCst) {
                    break;
                }
                tokio::select! {
                    _ = interval.tick() => ping.ping_all(),
                    _ = &mut shutdown => break,
                }
            }
        });

        let cleanup = self.clone();
        tokio::spawn(async move {
            let shutdown = cleanup.shutdown.notified();
            tokio::pin!(shutdown);
            let mut interval = tokio::time::interval(cleanup.config.stale_after);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                if cleanup.stopped.load(Ordering::SeqCst) {
                    break;
                }
                tokio::select! {
                    _ = interval.tick() => cleanup.remove_stale(),
                    _ = &mut shutdown => break,
                }
            }
        });

        info!("Fan-out started");
    }

    /// Stop the background loops and close all connections.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();
        // Dropping the senders closes each subscriber's outbound queue, which
        // ends its transport task.
        self.clients.clear();
        info!("Fan-out stopped");
    }

    /// Register a new subscriber and return its id.
    pub fn register(&self, sender: mpsc::Sender<ServerMessage>) -> Uuid {
        let id = Uuid::new_v4();
        self.clients.insert(
            id,
            Subscriber {
                sender,
                subscriptions: HashSet::new(),
                last_seen: Instant::now(),
            },
        );
        debug!("Subscriber {id} connected");
        id
    }

    /// Remove a subscriber.
    pub fn remove(&self, id: &Uuid) {
        if self.clients.remove(id).is_some() {
            debug!("Subscriber {id} removed");
        }
    }

    /// Add a channel key to a subscriber's subscription set.
    pub fn subscribe(&self, id: &Uuid, channel_key: impl Into<String>) {
        if let Some(mut client) = self.clients.get_mut(id) {
            client.subscriptions.insert(channel_key.into());
            client.last_seen = Instant::now();
        }
    }

    /// Remove a channel key from a subscriber's subscription set.
    pub fn unsubscribe(&self, id: &Uuid, channel_key: &str) {
        if let Some(mut client) = self.clients.get_mut(id) {
            client.subscriptions.remove(channel_key);
            client.last_seen = Instant::now();
        }
    }

    /// Mark a subscriber alive.
    pub fn touch(&self, id: &Uuid) {
        if let Some(mut client) = self.clients.get_mut(id) {
            client.last_seen = Instant::now();
        }
    }

    /// Send a message to one subscriber. Returns false if the send failed and
    /// the subscriber was removed.
    pub fn send_to(&self, id: &Uuid, message: ServerMessage) -> bool {
        let failed = match self.clients.get(id) {
            Some(client) => client.sender.try_send(message).is_err(),
            None => return false,
        };
        if failed {
            warn!("Dropping subscriber {id}: send failed");
            self.remove(id);
            return false;
        }
        true
    }

    /// Route a delta to every interested subscriber.
    ///
    /// A subscriber is interested when its subscription set contains the
    /// delta's channel key, or when the set is empty (firehose).
    pub fn publish(&self, delta: &Delta) {
        let message = ServerMessage::delta(delta);
        let mut broken = Vec::new();

        for client in self.clients.iter() {
            let interested = client.subscriptions.is_empty()
                || client.subscriptions.contains(&delta.channel_key);
            if interested && client.sender.try_send(message.clone()).is_err() {
                broken.push(*client.key());
            }
        }

        for id in broken {
            warn!("Dropping subscriber {id}: send failed");
            self.remove(&id);
        }
    }

    /// Report current client and subscription counts.
    pub fn stats(&self) -> FanoutStats {
        let now = Instant::now();
        let mut active = 0;
        let mut subscriptions = 0;
        for client in self.clients.iter() {
            if now.duration_since(client.last_seen) <= self.config.stale_after {
                active += 1;
            }
            subscriptions += client.subscriptions.len();
        }
        FanoutStats {
            total_clients: self.clients.len(),
            active_clients: active,
            total_subscriptions: subscriptions,
        }
    }

    /// Mount the WebSocket endpoint into an axum router.
    pub fn mount_into_router(self: &Arc<Self>, router: axum::Router, path: &str) -> axum::Router {
        ws::mount(self.clone(), router, path)
    }

    // Pings only queue; they are not evidence the client is alive. Liveness
    // comes from `touch`, driven by pongs, client pings and completed socket
    // writes.
    fn ping_all(&self) {
        let ping = ServerMessage::new("ping", json!(null));
        let mut broken = Vec::new();

        for client in self.clients.iter() {
            if client.sender.try_send(ping.clone()).is_err() {
                broken.push(*client.key());
            }
        }

        for id in broken {
            warn!("Dropping subscriber {id}: ping failed");
            self.remove(&id);
        }
    }

    fn remove_stale(&self) {
        let now = Instant::now();
        let stale: Vec<Uuid> = self
            .clients
            .iter()
            .filter(|client| now.duration_since(client.last_seen) > self.config.stale_after)
            .map(|client| *client.key())
            .collect();

        for id in stale {
            info!("Closing stale subscriber {id}");
            self.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::DeltaKind;
    use std::time::Duration;

    fn delta(key: &str) -> Delta {
        Delta {
            channel_key: key.to_string(),
            kind: DeltaKind::Milestone,
            data: json!({"key": key}),
        }
    }

    fn connect(fanout: &Fanout) -> (Uuid, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(16);
        (fanout.register(tx), rx)
    }

    #[tokio::test]
    async fn test_routing_by_subscription_key() {
        let fanout = Fanout::new(FanoutConfig::default());
        let (id, mut rx) = connect(&fanout);
        fanout.subscribe(&id, "item:42");

        fanout.publish(&delta("item:42"));
        fanout.publish(&delta("item:7"));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.channel_key.as_deref(), Some("item:42"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_empty_subscription_set_receives_everything() {
        let fanout = Fanout::new(FanoutConfig::default());
        let (_id, mut rx) = connect(&fanout);

        fanout.publish(&delta("item:42"));
        fanout.publish(&delta("item:7"));

        assert_eq!(rx.recv().await.unwrap().channel_key.as_deref(), Some("item:42"));
        assert_eq!(rx.recv().await.unwrap().channel_key.as_deref(), Some("item:7"));
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let fanout = Fanout::new(FanoutConfig::default());
        let (id, mut rx) = connect(&fanout);
        fanout.subscribe(&id, "item:42");
        fanout.unsubscribe(&id, "item:42");

        // Set is empty again, which means firehose, so it still receives.
        fanout.publish(&delta("item:7"));
        assert!(rx.recv().await.is_some());

        // A remaining disjoint subscription stops unrelated delivery.
        fanout.subscribe(&id, "item:1");
        fanout.publish(&delta("item:7"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_send_removes_subscriber() {
        let fanout = Fanout::new(FanoutConfig::default());
        let (tx, rx) = mpsc::channel(16);
        let id = fanout.register(tx);
        drop(rx);

        fanout.publish(&delta("item:42"));
        assert_eq!(fanout.stats().total_clients, 0);
        assert!(!fanout.send_to(&id, ServerMessage::new("ping", json!(null))));
    }

    #[tokio::test]
    async fn test_stale_subscriber_removed() {
        let fanout = Fanout::new(FanoutConfig {
            stale_after: Duration::from_millis(20),
            ..FanoutConfig::default()
        });
        let (_id, _rx) = connect(&fanout);
        assert_eq!(fanout.stats().active_clients, 1);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(fanout.stats().active_clients, 0);

        fanout.remove_stale();
        assert_eq!(fanout.stats().total_clients, 0);
    }

    #[tokio::test]
    async fn test_stats_counts_subscriptions() {
        let fanout = Fanout::new(FanoutConfig::default());
        let (a, _rx_a) = connect(&fanout);
        let (b, _rx_b) = connect(&fanout);
        fanout.subscribe(&a, "item:1");
        fanout.subscribe(&a, "item:2");
        fanout.subscribe(&b, "item:1");

        let stats = fanout.stats();
        assert_eq!(stats.total_clients, 2);
        assert_eq!(stats.total_subscriptions, 3);
    }

    #[tokio::test]
    async fn test_queued_ping_is_not_liveness() {
        let fanout = Fanout::new(FanoutConfig {
            stale_after: Duration::from_millis(20),
            ..FanoutConfig::default()
        });
        let (_silent, mut silent_rx) = connect(&fanout);
        let (ponging, _ponging_rx) = connect(&fanout);

        tokio::time::sleep(Duration::from_millis(40)).await;
        fanout.touch(&ponging);
        fanout.ping_all();

        // The ping was queued fine, but that alone must not reset staleness.
        assert_eq!(silent_rx.try_recv().unwrap().message_type, "ping");
        fanout.remove_stale();

        let stats = fanout.stats();
        assert_eq!(stats.total_clients, 1);
        assert!(fanout.send_to(&ponging, ServerMessage::new("ping", json!(null))));
    }

    #[tokio::test]
    async fn test_stop_halts_ping_loop() {
        let fanout = Arc::new(Fanout::new(FanoutConfig {
            ping_interval: Duration::from_millis(20),
            ..FanoutConfig::default()
        }));
        fanout.start();
        tokio::time::sleep(Duration::from_millis(30)).await;
        fanout.stop();

        // A subscriber registered after stop never gets pinged.
        let (_id, mut rx) = connect(&fanout);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stop_closes_all_connections() {
        let fanout = Arc::new(Fanout::new(FanoutConfig::default()));
        fanout.start();
        let (_id, mut rx) = connect(&fanout);

        fanout.stop();
        // Sender dropped, receiver observes closure.
        assert!(rx.recv().await.is_none());
        assert_eq!(fanout.stats().total_clients, 0);
    }
}
