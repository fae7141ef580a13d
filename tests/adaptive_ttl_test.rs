mod common;

use common::indexed_hash;

use block_relay::config::{DedupConfig, PerformanceMode};
use block_relay::services::dedup::Deduplicator;
use block_relay::services::event::{BlockEvent, Chain};

fn dedup() -> Deduplicator {
    Deduplicator::new(DedupConfig {
        base_ttl_seconds: 300,
        max_size: Some(10_000),
        performance_mode: PerformanceMode::Standard,
    })
}

/// A rapid stream (near-zero interblock gaps) pulls the adaptive window
/// below the base TTL, never below base/3
#[tokio::test]
async fn rapid_chain_shrinks_window() {
    let dedup = dedup();

    for i in 0..200u32 {
        let event = BlockEvent::new(Chain::Ethereum, indexed_hash(i), u64::from(i), "src");
        dedup.check_and_record(&event);
    }
    dedup.sweep();

    let stats = dedup.stats();
    let eth = stats.networks.get("ethereum").expect("ethereum stats");
    assert!(
        eth.adaptive_ttl_secs < 300.0,
        "rapid chain should shrink ttl, got {}",
        eth.adaptive_ttl_secs
    );
    assert!(eth.adaptive_ttl_secs >= 100.0, "bounded below by base/3");
    assert!(eth.avg_interblock_ms < 1_000.0);
}

/// The window stays within [base/3, 3*base] whatever the mode multiplier
#[tokio::test]
async fn window_respects_bounds_across_modes() {
    for mode in [
        PerformanceMode::Standard,
        PerformanceMode::HighPerformance,
        PerformanceMode::MemoryOptimized,
        PerformanceMode::LatencyOptimized,
    ] {
        let dedup = dedup();
        dedup.set_performance_mode(mode);
        for i in 0..50u32 {
            let event = BlockEvent::new(Chain::Bitcoin, indexed_hash(i), u64::from(i), "src");
            dedup.check_and_record(&event);
        }
        dedup.sweep();
        let stats = dedup.stats();
        let btc = stats.networks.get("bitcoin").expect("bitcoin stats");
        assert!(
            (100.0..=900.0).contains(&btc.adaptive_ttl_secs),
            "mode {:?} produced ttl {}",
            mode,
            btc.adaptive_ttl_secs
        );
    }
}

/// Duplicate pressure is visible in the published stats
#[tokio::test]
async fn duplicate_rate_tracks_pressure() {
    let dedup = dedup();

    let event = BlockEvent::new(Chain::Solana, indexed_hash(1), 1, "src");
    dedup.check_and_record(&event);
    for _ in 0..30 {
        dedup.check_and_record(&event);
    }
    dedup.sweep();

    let stats = dedup.stats();
    let sol = stats.networks.get("solana").expect("solana stats");
    assert!(sol.duplicate_rate > 0.2, "rate {}", sol.duplicate_rate);
}
