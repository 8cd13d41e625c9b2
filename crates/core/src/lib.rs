//! Client-side runtime for a decentralized pub/sub relay protocol: wire
//! codec, per-relay connections, a relay pool, an in-memory event cache, a
//! subscription intent manager, and an encrypted wallet-connect RPC layer.
//!
//! Cryptography (signing, verification, event-id hashing, payload
//! encryption) is deliberately not implemented here; callers supply a
//! `Signer`/`Encryptor` (see [`crypto`]). A reference implementation is
//! available under the `crypto` feature for tests and the demo CLI.

pub mod cache;
pub mod codec;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod event;
pub mod pool;
pub mod ratelimit;
pub mod rpc;
pub mod subscription;

pub use cache::{CacheStats, EventCache};
pub use codec::{ClientMessage, RelayMessage};
pub use config::{RateLimitConfig, RelayRuntimeConfig};
pub use connection::{Connection, ConnectionStatus, Inbound, Transport, TungsteniteTransport};
pub use crypto::{Clock, EncryptionScheme, Encryptor, Rng, Signer, SystemClock};
pub use error::{CryptoError, RelayError, Result};
pub use event::{Event, EventId, Filter, PublicKey, UnsignedEvent};
pub use pool::{PublishResult, PublishSubscribe, RelayHealth, RelayHealthStats, RelayPool};
pub use ratelimit::{backoff_delay, TokenBucket};
pub use rpc::RpcClient;
pub use subscription::{
    bridge_relay_pool, IntentOptions, Priority, RegisterOutcome, SharedSubscriptionManager,
    SubscriptionIntent, SubscriptionManager, SubscriptionStatus,
};
