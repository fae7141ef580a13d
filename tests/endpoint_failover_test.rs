mod common;

use block_relay::config::relay_config::{EndpointConfig, HealthConfig, RelayConfig, Tier};
use block_relay::config::{CacheConfig, CircuitConfig, DedupConfig, PipelineConfig};
use block_relay::services::endpoint::{ConnectionManager, EndpointRegistry};
use block_relay::services::event::{Chain, Transport};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn manager_with(urls: &[(&str, u8)]) -> ConnectionManager {
    let mut endpoints = HashMap::new();
    endpoints.insert(
        Chain::Bitcoin,
        urls.iter()
            .map(|(url, priority)| EndpointConfig {
                url: url.to_string(),
                transport: Transport::P2p,
                priority: *priority,
                region: None,
                provider: None,
            })
            .collect(),
    );
    let config = RelayConfig {
        chains: vec![Chain::Bitcoin],
        endpoints,
        tier: Tier::Enterprise,
        dedup: DedupConfig::default(),
        health: HealthConfig::default(),
        circuit: CircuitConfig::default(),
        cache: CacheConfig::default(),
        pipeline: PipelineConfig::default(),
    };
    let registry = Arc::new(EndpointRegistry::from_config(&config));
    ConnectionManager::new(registry, HealthConfig::default())
}

/// After max_failures_before_down consecutive failures, get_best never
/// returns the endpoint until its next successful probe
#[tokio::test]
async fn failed_endpoint_excluded_until_probe_recovers() {
    let manager = manager_with(&[("p1.example.com:8333", 1), ("p2.example.com:8333", 5)]);

    // P1 is best-scored initially
    assert_eq!(
        manager.get_best(Chain::Bitcoin, Transport::P2p).unwrap().url,
        "p1.example.com:8333"
    );

    // Three consecutive failed block requests on P1
    for _ in 0..3 {
        manager.report_result("p1.example.com:8333", Duration::from_millis(80), false);
    }
    assert!(!manager.is_healthy("p1.example.com:8333"));

    // Requests now route to P2, repeatedly
    for _ in 0..5 {
        assert_eq!(
            manager.get_best(Chain::Bitcoin, Transport::P2p).unwrap().url,
            "p2.example.com:8333"
        );
    }

    // The next successful health probe flips it back
    manager.report_result("p1.example.com:8333", Duration::from_millis(40), true);
    assert!(manager.is_healthy("p1.example.com:8333"));
    assert!(manager
        .list_healthy(Chain::Bitcoin)
        .iter()
        .any(|ep| ep.url == "p1.example.com:8333"));
}

/// Exhausting every endpoint surfaces NoHealthyEndpoint instead of a stale
/// selection
#[tokio::test]
async fn all_endpoints_down_is_an_error() {
    let manager = manager_with(&[("p1.example.com:8333", 1)]);
    for _ in 0..3 {
        manager.report_result("p1.example.com:8333", Duration::from_millis(80), false);
    }
    assert!(manager.get_best(Chain::Bitcoin, Transport::P2p).is_err());
}

/// Health transitions reach subscribers (adapters drop their persistent
/// connections on these)
#[tokio::test]
async fn transitions_are_broadcast() {
    let manager = manager_with(&[("p1.example.com:8333", 1)]);
    let mut transitions = manager.transitions();

    for _ in 0..3 {
        manager.report_result("p1.example.com:8333", Duration::from_millis(80), false);
    }
    let down = transitions.recv().await.unwrap();
    assert!(!down.is_healthy);

    manager.report_result("p1.example.com:8333", Duration::from_millis(20), true);
    let up = transitions.recv().await.unwrap();
    assert!(up.is_healthy);
}
