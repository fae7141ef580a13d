use serde::Serialize;
use std::time::{Duration, Instant};

use crate::services::event::Chain;

/// EMA smoothing bounds; the effective alpha moves with observed variance
const ALPHA_MIN: f64 = 0.05;
const ALPHA_MAX: f64 = 0.3;

/// Reliability floor so the retention window never collapses on a quiet chain
const RELIABILITY_FLOOR: f64 = 0.5;

/// Per-chain timing and quality statistics feeding the adaptive TTL.
///
/// Updated on every ingest; recomputed on the periodic sweep.
#[derive(Debug, Clone)]
pub struct NetworkStats {
    chain: Chain,
    /// EMA of the gap between consecutive first-seen blocks, in milliseconds
    pub avg_interblock_ms: f64,
    /// EMA of squared deviation, drives the adaptive alpha
    variance_ms2: f64,
    pub duplicate_rate: f64,
    /// Network trust factor in [RELIABILITY_FLOOR, 1]
    pub reliability: f64,
    /// 1..=5, set by the performance mode
    pub optimization_level: u8,
    last_block_at: Option<Instant>,
    window_first_seen: u64,
    window_duplicates: u64,
}

impl NetworkStats {
    pub fn new(chain: Chain) -> Self {
        Self {
            chain,
            avg_interblock_ms: chain.nominal_interblock().as_secs_f64() * 1_000.0,
            variance_ms2: 0.0,
            duplicate_rate: 0.0,
            reliability: 1.0,
            optimization_level: 2,
            last_block_at: None,
            window_first_seen: 0,
            window_duplicates: 0,
        }
    }

    pub fn chain(&self) -> Chain {
        self.chain
    }

    /// Record a first-seen block and fold its arrival gap into the EMA
    pub fn record_first_seen(&mut self, now: Instant) {
        self.window_first_seen += 1;
        if let Some(last) = self.last_block_at {
            let gap_ms = now.duration_since(last).as_secs_f64() * 1_000.0;
            let alpha = self.adaptive_alpha();
            let deviation = gap_ms - self.avg_interblock_ms;
            self.avg_interblock_ms += alpha * deviation;
            self.variance_ms2 =
                alpha * deviation * deviation + (1.0 - alpha) * self.variance_ms2;
        }
        self.last_block_at = Some(now);
    }

    pub fn record_duplicate(&mut self) {
        self.window_duplicates += 1;
    }

    /// Higher variance means a noisier gap signal, so the EMA smooths harder
    fn adaptive_alpha(&self) -> f64 {
        if self.avg_interblock_ms <= 0.0 {
            return ALPHA_MAX;
        }
        let cv = self.variance_ms2.sqrt() / self.avg_interblock_ms;
        (ALPHA_MAX - 0.25 * cv.min(1.0)).clamp(ALPHA_MIN, ALPHA_MAX)
    }

    /// Fold the window counters into the running rates; called by the sweep
    pub fn recompute(&mut self) {
        let total = self.window_first_seen + self.window_duplicates;
        if total > 0 {
            let window_rate = self.window_duplicates as f64 / total as f64;
            self.duplicate_rate = 0.7 * self.duplicate_rate + 0.3 * window_rate;
        }
        self.window_first_seen = 0;
        self.window_duplicates = 0;

        // Trust decays when the chain goes silent far beyond its cadence
        let expected = Duration::from_secs_f64((self.avg_interblock_ms / 1_000.0).max(0.001));
        let sample = match self.last_block_at {
            Some(last) if last.elapsed() < expected * 3 => 1.0,
            Some(_) => 0.7,
            None => 1.0,
        };
        self.reliability = (0.9 * self.reliability + 0.1 * sample).clamp(RELIABILITY_FLOOR, 1.0);
    }

    /// Adaptive retention window.
    ///
    /// Fast chains keep a short window (duplicates cluster tightly behind the
    /// announcement), slow chains a long one; duplicate pressure stretches it
    /// and low trust shrinks it. Always bounded to [base/3, 3*base].
    pub fn adaptive_ttl(&self, base_ttl: Duration) -> Duration {
        let base_ms = base_ttl.as_secs_f64() * 1_000.0;
        // Reference cadence: a chain producing one block per base_ttl/10
        // sits exactly at the neutral factor
        let reference_ms = base_ms / 10.0;
        let frequency_factor = (self.avg_interblock_ms / reference_ms).clamp(1.0 / 3.0, 3.0);
        let duplicate_pressure = 1.0 + self.duplicate_rate * 2.0;
        let mode_multiplier = 1.0 + 0.1 * self.optimization_level as f64;

        let ttl_ms = base_ms * frequency_factor * duplicate_pressure * self.reliability * mode_multiplier;
        let bounded = ttl_ms.clamp(base_ms / 3.0, base_ms * 3.0);
        Duration::from_secs_f64(bounded / 1_000.0)
    }

    pub fn snapshot(&self, base_ttl: Duration) -> NetworkStatsSnapshot {
        NetworkStatsSnapshot {
            chain: self.chain,
            avg_interblock_ms: self.avg_interblock_ms,
            duplicate_rate: self.duplicate_rate,
            reliability: self.reliability,
            optimization_level: self.optimization_level,
            adaptive_ttl_secs: self.adaptive_ttl(base_ttl).as_secs_f64(),
        }
    }
}

/// Serializable stats view exposed by `Deduplicator::stats`
#[derive(Debug, Clone, Serialize)]
pub struct NetworkStatsSnapshot {
    pub chain: Chain,
    pub avg_interblock_ms: f64,
    pub duplicate_rate: f64,
    pub reliability: f64,
    pub optimization_level: u8,
    pub adaptive_ttl_secs: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_gaps(stats: &mut NetworkStats, gap: Duration, count: usize) {
        // Synthesize a regular arrival sequence with explicit timestamps
        let mut now = Instant::now();
        stats.last_block_at = Some(now);
        for _ in 0..count {
            now += gap;
            stats.record_first_seen(now);
        }
    }

    #[test]
    fn test_rapid_chain_shrinks_ttl_below_base() {
        let mut stats = NetworkStats::new(Chain::Ethereum);
        feed_gaps(&mut stats, Duration::from_secs(1), 200);
        let base = Duration::from_secs(300);
        let ttl = stats.adaptive_ttl(base);
        assert!(ttl < base, "expected ttl {:?} below base {:?}", ttl, base);
        assert!(ttl >= base / 3);
    }

    #[test]
    fn test_slow_chain_grows_ttl_bounded() {
        let mut stats = NetworkStats::new(Chain::Ethereum);
        feed_gaps(&mut stats, Duration::from_secs(1), 200);
        let base = Duration::from_secs(300);
        let rapid_ttl = stats.adaptive_ttl(base);

        feed_gaps(&mut stats, Duration::from_secs(60), 200);
        let slow_ttl = stats.adaptive_ttl(base);
        assert!(slow_ttl > rapid_ttl);
        assert!(slow_ttl <= base * 3);
    }

    #[test]
    fn test_duplicate_pressure_stretches_ttl() {
        let mut stats = NetworkStats::new(Chain::Bitcoin);
        let base = Duration::from_secs(300);
        let before = stats.adaptive_ttl(base);

        for _ in 0..80 {
            stats.record_duplicate();
        }
        stats.window_first_seen = 20;
        stats.recompute();
        assert!(stats.duplicate_rate > 0.0);
        assert!(stats.adaptive_ttl(base) >= before);
    }

    #[test]
    fn test_alpha_stays_in_bounds() {
        let mut stats = NetworkStats::new(Chain::Solana);
        // Wildly irregular gaps
        for gap_secs in [1u64, 120, 2, 300, 1, 600] {
            feed_gaps(&mut stats, Duration::from_secs(gap_secs), 1);
        }
        let alpha = stats.adaptive_alpha();
        assert!((ALPHA_MIN..=ALPHA_MAX).contains(&alpha));
    }

    #[test]
    fn test_reliability_never_below_floor() {
        let mut stats = NetworkStats::new(Chain::Bitcoin);
        stats.avg_interblock_ms = 1.0;
        stats.last_block_at = Some(Instant::now() - Duration::from_secs(600));
        for _ in 0..200 {
            stats.recompute();
        }
        assert!(stats.reliability >= RELIABILITY_FLOOR);
    }
}
