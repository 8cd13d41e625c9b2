//! Relay pool / fleet manager (§4.3 / C3).
//!
//! Grounded in `connections::connection_registry::ConnectionRegistry`: a
//! `RwLock<HashMap<url, Arc<Connection>>>` registry, `send_to_relays`
//! fanning a frame set out to a relay subset, and `close_all` tearing every
//! connection down. The registry's manual `Clone` (clone every `Arc` field)
//! and `Drop` (log, let every connection's own `Drop` do the rest) are kept
//! as-is; the teacher's closures-for-callbacks (`out_writer`/
//! `status_writer`) are replaced with the bounded `Inbound` channel already
//! threaded through `Connection`, broadcast back out to every interested
//! consumer (subscription routing, RPC, a host application's own listener)
//! since this runtime has no JS event bridge to call back into.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures_util::future::join_all;
use rustc_hash::FxHashMap;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::codec::RelayMessage;
use crate::config::RelayRuntimeConfig;
use crate::connection::{Connection, ConnectionStatus, Inbound, Transport, TungsteniteTransport};
use crate::crypto::Rng;
use crate::error::{RelayError, Result};
use crate::event::{Event, EventId, Filter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayHealth {
    Healthy,
    Reconnecting,
    Quarantined,
}

/// Rolling per-relay stats (§4.3): an EWMA success rate blended from every
/// publish acknowledgment, an EWMA average latency, a running error count,
/// and the wall-clock time of the last observation. Quarantine triggers once
/// `success_rate` drops below 0.5 or `error_count` reaches the configured
/// threshold.
#[derive(Debug, Clone)]
pub struct RelayHealthStats {
    pub success_rate: f64,
    pub average_latency: Duration,
    pub error_count: u64,
    pub last_seen: Option<u64>,
}

impl Default for RelayHealthStats {
    fn default() -> Self {
        Self {
            success_rate: 1.0,
            average_latency: Duration::ZERO,
            error_count: 0,
            last_seen: None,
        }
    }
}

const HEALTH_EWMA_ALPHA: f64 = 0.2;

impl RelayHealthStats {
    fn record_outcome(&mut self, success: bool) {
        let sample = if success { 1.0 } else { 0.0 };
        self.success_rate = HEALTH_EWMA_ALPHA * sample + (1.0 - HEALTH_EWMA_ALPHA) * self.success_rate;
        if !success {
            self.error_count += 1;
        }
        self.last_seen = SystemTime::now().duration_since(UNIX_EPOCH).ok().map(|d| d.as_secs());
    }

    pub fn is_unhealthy(&self, error_threshold: u64) -> bool {
        self.success_rate < 0.5 || self.error_count >= error_threshold
    }
}

/// Per-event, per-relay publish result (§4.3 "Publish acknowledgment",
/// §4.3's `PublishResult{successes, failures}` contract).
#[derive(Debug, Clone, Default)]
pub struct PublishResult {
    pub successes: Vec<String>,
    pub failures: Vec<(String, String)>,
}

/// State shared between `RelayPool` and its background inbound-frame
/// processor: pending publish acks, rolling health stats, the quarantine
/// set, and the broadcast fan-out of every inbound frame.
struct Shared {
    config: Arc<RelayRuntimeConfig>,
    pending_acks: RwLock<FxHashMap<(EventId, String), oneshot::Sender<std::result::Result<(), String>>>>,
    health: RwLock<HashMap<String, RelayHealthStats>>,
    quarantined: RwLock<HashMap<String, u32>>,
    broadcast_tx: broadcast::Sender<Inbound>,
}

impl Shared {
    async fn record_outcome(&self, relay: &str, success: bool) {
        let mut health = self.health.write().await;
        let entry = health.entry(relay.to_string()).or_default();
        entry.record_outcome(success);
        let unhealthy = entry.is_unhealthy(self.config.error_quarantine_threshold);
        drop(health);
        if unhealthy {
            let mut quarantined = self.quarantined.write().await;
            if quarantined.insert(relay.to_string(), 0).is_none() {
                tracing::warn!(relay, "relay auto-quarantined after health degraded below threshold");
            }
        }
    }
}

async fn process_inbound(shared: Arc<Shared>, mut inbound_rx: mpsc::Receiver<Inbound>) {
    while let Some(inbound) = inbound_rx.recv().await {
        if let RelayMessage::Ok {
            event_id,
            accepted,
            message,
        } = &inbound.message
        {
            if let Ok(id) = EventId::from_hex(event_id) {
                if let Some(tx) = shared.pending_acks.write().await.remove(&(id, inbound.relay_url.clone())) {
                    let _ = tx.send(if *accepted { Ok(()) } else { Err(message.clone()) });
                }
                shared.record_outcome(&inbound.relay_url, *accepted).await;
            }
        }
        // Fan the frame back out; `send` only errors when there are no
        // receivers, which is harmless (nobody is listening yet).
        let _ = shared.broadcast_tx.send(inbound);
    }
}

/// Manages the set of relay connections this client talks to. Adding a
/// relay beyond `max_relays` or one already quarantined is rejected rather
/// than silently ignored (§4.3).
pub struct RelayPool<T: Transport + 'static = TungsteniteTransport> {
    connections: RwLock<HashMap<String, Arc<Connection<T>>>>,
    config: Arc<RelayRuntimeConfig>,
    inbound_tx: mpsc::Sender<Inbound>,
    rng: Arc<dyn Rng>,
    shared: Arc<Shared>,
    processor: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Transport + 'static> RelayPool<T> {
    pub fn new(config: Arc<RelayRuntimeConfig>, rng: Arc<dyn Rng>) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.send_queue_depth);
        let (broadcast_tx, _) = broadcast::channel(1024);
        let shared = Arc::new(Shared {
            config: config.clone(),
            pending_acks: RwLock::new(FxHashMap::default()),
            health: RwLock::new(HashMap::new()),
            quarantined: RwLock::new(HashMap::new()),
            broadcast_tx,
        });
        let processor = tokio::spawn(process_inbound(shared.clone(), inbound_rx));

        Self {
            connections: RwLock::new(HashMap::new()),
            config,
            inbound_tx,
            rng,
            shared,
            processor: Mutex::new(Some(processor)),
        }
    }

    /// Subscribes to every inbound frame from every relay in this pool, in
    /// arrival order. Used to bridge relay traffic into the subscription
    /// manager and the RPC layer without the pool needing to know about
    /// either.
    pub fn subscribe_events(&self) -> broadcast::Receiver<Inbound> {
        self.shared.broadcast_tx.subscribe()
    }

    pub async fn add_relay(&self, url: String) -> Result<()> {
        if self.shared.quarantined.read().await.contains_key(&url) {
            return Err(RelayError::validation(format!("relay quarantined: {url}")));
        }
        let mut connections = self.connections.write().await;
        if connections.contains_key(&url) {
            return Ok(());
        }
        if connections.len() >= self.config.max_relays {
            return Err(RelayError::configuration(format!(
                "relay pool at capacity ({})",
                self.config.max_relays
            )));
        }
        let connection = Connection::new(url.clone(), self.config.clone(), self.inbound_tx.clone(), self.rng.clone())?;
        connections.insert(url, Arc::new(connection));
        Ok(())
    }

    pub async fn remove_relay(&self, url: &str) {
        if let Some(conn) = self.connections.write().await.remove(url) {
            conn.close().await;
        }
    }

    pub async fn relay_urls(&self) -> Vec<String> {
        self.connections.read().await.keys().cloned().collect()
    }

    pub async fn health(&self, url: &str) -> Option<RelayHealth> {
        if self.shared.quarantined.read().await.contains_key(url) {
            return Some(RelayHealth::Quarantined);
        }
        let connections = self.connections.read().await;
        let conn = connections.get(url)?;
        Some(match conn.status().await {
            ConnectionStatus::Connected => RelayHealth::Healthy,
            ConnectionStatus::Failed => RelayHealth::Quarantined,
            _ => RelayHealth::Reconnecting,
        })
    }

    /// Detailed rolling stats behind the 3-state `health()` classification
    /// (§4.3).
    pub async fn health_stats(&self, url: &str) -> Option<RelayHealthStats> {
        self.shared.health.read().await.get(url).cloned()
    }

    /// Marks a relay as quarantined after repeated failures, so `add_relay`
    /// refuses to resurrect it until the caller explicitly clears it.
    pub async fn quarantine(&self, url: String) {
        self.remove_relay(&url).await;
        self.shared.quarantined.write().await.insert(url, 0);
    }

    pub async fn clear_quarantine(&self, url: &str) {
        self.shared.quarantined.write().await.remove(url);
        self.shared.health.write().await.remove(url);
    }

    /// Opens (or replays, via the connection's own reconnect logic) a
    /// subscription on every relay in `relays`, or the whole pool if empty.
    pub async fn open_subscription(&self, relays: &[String], subscription_id: &str, filters: &[Filter]) -> Result<()> {
        crate::codec::validate_req_filters(filters)?;
        let connections = self.connections.read().await;
        let targets: Vec<&Arc<Connection<T>>> = if relays.is_empty() {
            connections.values().collect()
        } else {
            relays.iter().filter_map(|u| connections.get(u)).collect()
        };
        for conn in targets {
            conn.subscribe(subscription_id.to_string(), filters.to_vec()).await?;
        }
        Ok(())
    }

    pub async fn close_subscription_everywhere(&self, subscription_id: &str) {
        let connections = self.connections.read().await;
        for conn in connections.values() {
            let _ = conn.close_subscription(subscription_id.to_string()).await;
        }
    }

    /// Publishes to every healthy relay, falling back to any non-quarantined
    /// relay if none are currently `Connected` (§4.3's staged-selection
    /// fallback). Waits (bounded by `publish_ack_timeout`) for each target's
    /// `OK` frame and reports the outcome per relay (§4.3, invariant #5)
    /// rather than merely counting successful sends.
    pub async fn publish(&self, event: Event) -> Result<PublishResult> {
        let connections = self.connections.read().await;
        let mut healthy = Vec::new();
        let mut fallback = Vec::new();
        for (url, conn) in connections.iter() {
            if conn.status().await.is_connected() {
                healthy.push((url.clone(), conn.clone()));
            } else {
                fallback.push((url.clone(), conn.clone()));
            }
        }
        drop(connections);
        let targets = if !healthy.is_empty() { healthy } else { fallback };
        if targets.is_empty() {
            return Err(RelayError::network("no relays available"));
        }

        let mut waiters = Vec::with_capacity(targets.len());
        for (url, conn) in &targets {
            let (tx, rx) = oneshot::channel();
            self.shared.pending_acks.write().await.insert((event.id, url.clone()), tx);
            if let Err(e) = conn.publish(event.clone()).await {
                self.shared.pending_acks.write().await.remove(&(event.id, url.clone()));
                waiters.push((url.clone(), Err(e.to_string())));
                continue;
            }
            waiters.push((url.clone(), Ok(rx)));
        }

        let ack_timeout = self.config.publish_ack_timeout;
        let event_id = event.id;
        let shared = self.shared.clone();
        let outcomes = join_all(waiters.into_iter().map(|(url, waiter)| {
            let shared = shared.clone();
            async move {
                match waiter {
                    Err(reason) => (url, Err(reason)),
                    Ok(rx) => match tokio::time::timeout(ack_timeout, rx).await {
                        Ok(Ok(Ok(()))) => (url, Ok(())),
                        Ok(Ok(Err(reason))) => (url, Err(reason)),
                        Ok(Err(_)) => (url, Err("acknowledgement channel closed".to_string())),
                        Err(_) => {
                            shared.pending_acks.write().await.remove(&(event_id, url.clone()));
                            (url, Err("publish acknowledgement timed out".to_string()))
                        }
                    },
                }
            }
        }))
        .await;

        let mut result = PublishResult::default();
        for (url, outcome) in outcomes {
            match outcome {
                Ok(()) => result.successes.push(url),
                Err(reason) => result.failures.push((url, reason)),
            }
        }
        Ok(result)
    }
}

impl<T: Transport + 'static> Drop for RelayPool<T> {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.processor.try_lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
        tracing::debug!("dropping relay pool - all connections will close");
    }
}

/// Small async-trait seam so the RPC layer (§4.6) can depend on "a thing
/// that publishes and manages upstream subscriptions" without being generic
/// over the pool's transport type.
#[async_trait]
pub trait PublishSubscribe: Send + Sync {
    async fn publish(&self, event: Event) -> Result<PublishResult>;
    async fn open_subscription(&self, relays: &[String], subscription_id: &str, filters: &[Filter]) -> Result<()>;
    async fn close_subscription_everywhere(&self, subscription_id: &str);
}

#[async_trait]
impl<T: Transport + 'static> PublishSubscribe for RelayPool<T> {
    async fn publish(&self, event: Event) -> Result<PublishResult> {
        RelayPool::publish(self, event).await
    }

    async fn open_subscription(&self, relays: &[String], subscription_id: &str, filters: &[Filter]) -> Result<()> {
        RelayPool::open_subscription(self, relays, subscription_id, filters).await
    }

    async fn close_subscription_everywhere(&self, subscription_id: &str) {
        RelayPool::close_subscription_everywhere(self, subscription_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{TransportSink, TransportStream};

    struct NeverConnects;
    #[async_trait]
    impl Transport for NeverConnects {
        async fn connect(_url: &str) -> Result<(Box<dyn TransportSink>, Box<dyn TransportStream>)> {
            Err(RelayError::network("no network in test"))
        }
    }

    struct FixedRng;
    impl Rng for FixedRng {
        fn next_f64(&self) -> f64 {
            0.0
        }
    }

    fn test_pool() -> RelayPool<NeverConnects> {
        RelayPool::new(Arc::new(RelayRuntimeConfig::default()), Arc::new(FixedRng))
    }

    #[tokio::test]
    async fn add_relay_rejects_over_capacity() {
        let mut config = RelayRuntimeConfig::default();
        config.max_relays = 1;
        let pool: RelayPool<NeverConnects> = RelayPool::new(Arc::new(config), Arc::new(FixedRng));
        pool.add_relay("wss://a".into()).await.unwrap();
        assert!(pool.add_relay("wss://b".into()).await.is_err());
    }

    #[tokio::test]
    async fn quarantined_relay_rejected_until_cleared() {
        let pool = test_pool();
        pool.add_relay("wss://a".into()).await.unwrap();
        pool.quarantine("wss://a".into()).await;
        assert!(pool.add_relay("wss://a".into()).await.is_err());
        pool.clear_quarantine("wss://a").await;
        assert!(pool.add_relay("wss://a".into()).await.is_ok());
    }

    #[tokio::test]
    async fn add_relay_rejects_bad_scheme() {
        let pool = test_pool();
        assert!(pool.add_relay("https://a".into()).await.is_err());
    }

    #[tokio::test]
    async fn publish_with_no_relays_errors() {
        let pool = test_pool();
        let event = Event {
            id: crate::event::EventId([0; 32]),
            pubkey: crate::event::PublicKey([0; 32]),
            created_at: 0,
            kind: 1,
            tags: vec![],
            content: String::new(),
            sig: "00".repeat(64),
        };
        assert!(pool.publish(event).await.is_err());
    }

    #[test]
    fn health_stats_quarantine_threshold() {
        let mut stats = RelayHealthStats::default();
        for _ in 0..5 {
            stats.record_outcome(false);
        }
        assert!(stats.is_unhealthy(5));
        assert!(stats.success_rate < 0.5);
    }
}
