//! Smoke-test binary for `relay-runtime`: connects to one or more relays,
//! opens a subscription, and prints matching events as they arrive. Mirrors
//! the role the teacher's `native-ffi` crate plays for its own core logic —
//! a thin, native entry point exercising the library outside a browser.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::Parser;
use relay_runtime::{
    bridge_relay_pool, crypto::reference::ReferenceSigner, Filter, RegisterOutcome, RelayHealth,
    RelayPool, RelayRuntimeConfig, SubscriptionIntent, SubscriptionManager, SystemClock,
    TungsteniteTransport,
};
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(about = "Connect to relays and print matching events")]
struct Args {
    /// Relay WebSocket URLs, e.g. wss://relay.damus.io
    #[arg(required = true)]
    relays: Vec<String>,

    /// Event kinds to subscribe to (repeatable)
    #[arg(short, long)]
    kind: Vec<u16>,

    /// Max number of events to request
    #[arg(short, long, default_value_t = 20)]
    limit: usize,
}

struct ThreadRng;
impl relay_runtime::Rng for ThreadRng {
    fn next_f64(&self) -> f64 {
        use rand::Rng as _;
        rand::thread_rng().gen_range(0.0..1.0)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let _identity = ReferenceSigner::generate();

    let config = Arc::new(RelayRuntimeConfig::default());
    let pool: Arc<RelayPool<TungsteniteTransport>> = Arc::new(RelayPool::new(config.clone(), Arc::new(ThreadRng)));

    for relay in &args.relays {
        match pool.add_relay(relay.clone()).await {
            Ok(()) => tracing::info!(relay, "registered"),
            Err(e) => tracing::warn!(relay, error = %e, "failed to register relay"),
        }
    }

    let cache = Arc::new(relay_runtime::EventCache::new(config.cache_max_events, config.cache_retain_ratio));
    let signer = Arc::new(ReferenceSigner::generate());
    let subscriptions = Arc::new(SubscriptionManager::new(config.clone(), cache, signer, Arc::new(SystemClock)));
    bridge_relay_pool(pool.as_ref(), subscriptions.clone());

    let (events_tx, mut events_rx) = mpsc::channel(256);
    let filter = Filter {
        kinds: if args.kind.is_empty() { None } else { Some(args.kind.clone()) },
        limit: Some(args.limit),
        ..Default::default()
    };
    let intent = SubscriptionIntent {
        id: "cli-main".into(),
        filters: vec![filter.clone()],
        relays: args.relays.clone(),
        events_tx,
        options: Default::default(),
    };
    let RegisterOutcome::Opened {
        upstream_id,
        filters_to_send,
    } = subscriptions.register(intent).await?;
    if let Some(filters) = filters_to_send {
        pool.open_subscription(&args.relays, &upstream_id, &filters).await?;
    }

    let deadline = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() + 15;
    while SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() < deadline {
        match tokio::time::timeout(std::time::Duration::from_secs(1), events_rx.recv()).await {
            Ok(Some(event)) => println!("{}", serde_json::to_string(&event)?),
            Ok(None) => break,
            Err(_) => {
                for relay in &args.relays {
                    if let Some(RelayHealth::Quarantined) = pool.health(relay).await {
                        tracing::warn!(relay, "quarantined");
                    }
                }
            }
        }
    }

    Ok(())
}
