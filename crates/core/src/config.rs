//! Configuration surface (§6) shared by every component. Constructed once by
//! the host application and handed to the pool/subscription manager/RPC
//! layer via `Arc`, mirroring the teacher's `RelayConfig` passed into
//! `RelayConnection::new`.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub capacity: u32,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 20,
            window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayRuntimeConfig {
    pub max_relays: usize,
    pub connect_timeout: Duration,
    pub keepalive: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub reconnect_max_attempts: u32,
    pub reconnect_jitter: f64,
    pub publish_ack_timeout: Duration,
    pub rpc_response_timeout: Duration,
    pub cache_max_events: usize,
    pub cache_retain_ratio: f64,
    pub merge_ceiling: usize,
    pub default_intent_buffer: usize,
    pub default_inactivity_timeout: Duration,
    pub rate_limit: RateLimitConfig,
    pub clock_skew: Duration,
    pub send_queue_depth: usize,
    /// Per-relay cap on concurrently open upstream subscriptions, enforced
    /// by the subscription manager's priority-based displacement (§4.5).
    pub max_upstream_subs_per_relay: usize,
    /// A relay is auto-quarantined once its EWMA success rate drops below
    /// 0.5 or its error count reaches this threshold (§4.3).
    pub error_quarantine_threshold: u64,
}

impl Default for RelayRuntimeConfig {
    fn default() -> Self {
        Self {
            max_relays: 32,
            connect_timeout: Duration::from_secs(10),
            keepalive: Duration::from_secs(30),
            reconnect_base: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(300),
            reconnect_max_attempts: 10,
            reconnect_jitter: 1.0,
            publish_ack_timeout: Duration::from_secs(10),
            rpc_response_timeout: Duration::from_secs(60),
            cache_max_events: 10_000,
            cache_retain_ratio: 0.2,
            merge_ceiling: 1000,
            default_intent_buffer: 256,
            default_inactivity_timeout: Duration::from_secs(300),
            rate_limit: RateLimitConfig::default(),
            clock_skew: Duration::from_secs(60),
            send_queue_depth: 256,
            max_upstream_subs_per_relay: 64,
            error_quarantine_threshold: 5,
        }
    }
}
