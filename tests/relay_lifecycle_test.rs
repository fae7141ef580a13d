mod common;

use block_relay::config::relay_config::{EndpointConfig, RelayConfig, Tier};
use block_relay::config::{
    CacheConfig, CircuitConfig, DedupConfig, HealthConfig, PipelineConfig,
};
use block_relay::services::metrics::RelayMetrics;
use block_relay::services::relay::{Relay, StartupError};
use block_relay::services::event::{Chain, Transport};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn config_with_p2p(url: &str) -> RelayConfig {
    let mut endpoints = HashMap::new();
    endpoints.insert(
        Chain::Bitcoin,
        vec![EndpointConfig {
            url: url.to_string(),
            transport: Transport::P2p,
            priority: 1,
            region: None,
            provider: None,
        }],
    );
    RelayConfig {
        chains: vec![Chain::Bitcoin],
        endpoints,
        tier: Tier::Free,
        dedup: DedupConfig::default(),
        health: HealthConfig::default(),
        circuit: CircuitConfig::default(),
        cache: CacheConfig::default(),
        pipeline: PipelineConfig::default(),
    }
}

/// With no reachable endpoint, startup gives up after the grace window
/// (the condition behind exit code 2)
#[tokio::test]
async fn startup_fails_without_reachable_endpoints() {
    // Nothing listens on port 1
    let config = config_with_p2p("127.0.0.1:1");
    let metrics = RelayMetrics::new().unwrap();
    let relay = Relay::new(config, metrics, None).with_startup_grace(Duration::ZERO);

    match relay.start().await {
        Err(StartupError::NoHealthyEndpoints(chain)) => assert_eq!(chain, Chain::Bitcoin),
        other => panic!("expected startup failure, got {:?}", other.is_ok()),
    }
}

/// With a dialable endpoint the relay starts, and shutdown is idempotent
#[tokio::test]
async fn start_and_idempotent_shutdown() {
    // A bare TCP listener satisfies the shallow P2P probe
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            if listener.accept().await.is_err() {
                break;
            }
        }
    });

    let config = config_with_p2p(&addr.to_string());
    let metrics = RelayMetrics::new().unwrap();
    let relay = Arc::new(
        Relay::new(config, metrics, None).with_startup_grace(Duration::from_secs(10)),
    );

    relay.start().await.expect("relay starts");
    // Second start is a no-op
    relay.start().await.expect("start is idempotent");

    let _stream = relay.subscribe(Some(Chain::Bitcoin));

    tokio::time::timeout(Duration::from_secs(40), relay.shutdown())
        .await
        .expect("shutdown within grace");
    // Idempotent: a second call returns immediately
    tokio::time::timeout(Duration::from_secs(1), relay.shutdown())
        .await
        .expect("second shutdown is a no-op");
}

/// Warm-restart snapshots survive a full stop/start cycle
#[tokio::test]
async fn warm_restart_restores_processed_hashes() {
    use block_relay::services::persist::StateStore;
    use common::block_event;

    let dir = std::env::temp_dir().join(format!("relay-lifecycle-{}", uuid::Uuid::new_v4()));

    {
        let harness = common::pipeline_harness(16);
        harness.ingestor.submit(block_event(Chain::Bitcoin, 0x11, 1, "peer"));
        let store = StateStore::new(&dir);
        store.save_processed(&harness.dedup).unwrap();
    }

    // A fresh process suppresses the replayed block
    let harness = common::pipeline_harness(16);
    let store = StateStore::new(&dir);
    assert_eq!(store.load_processed(&harness.dedup), 1);
    assert_eq!(
        harness.ingestor.submit(block_event(Chain::Bitcoin, 0x11, 1, "peer")),
        block_relay::services::event::EmitResult::DroppedDuplicate
    );

    std::fs::remove_dir_all(&dir).ok();
}
