use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::config::relay_config::{DedupConfig, PerformanceMode};
use crate::services::dedup::lock_table::{HashGuard, HashLockTable};
use crate::services::dedup::stats::{NetworkStats, NetworkStatsSnapshot};
use crate::services::event::{BlockEvent, BlockHash, Chain};
use crate::services::metrics::RelayMetrics;

/// Upper bound on corroborating sources tracked per record
const MAX_SOURCES: usize = 16;
/// Sweep cadence for TTL expiry and stats recompute
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
/// Deferred-eviction count at which the overflow alarm fires
const DEFERRAL_ALARM_THRESHOLD: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupeOutcome {
    FirstSeen,
    Duplicate,
}

/// One record per `(chain, hash)` seen within the adaptive window.
/// Mutated only by the deduplicator.
#[derive(Debug, Clone)]
pub struct DedupeRecord {
    pub first_seen: Instant,
    pub last_seen: Instant,
    pub seen_count: u32,
    /// Distinct delivering endpoints, bounded to MAX_SOURCES
    pub sources: Vec<String>,
    /// Corroboration level in [0, 1]; grows with distinct sources
    pub confidence: f64,
    /// 1..=10, 10 most important; full blocks rank above bare headers
    pub priority: u8,
    pub height: u64,
}

impl DedupeRecord {
    fn new(event: &BlockEvent, now: Instant) -> Self {
        let priority = if event.is_header_only { 5 } else { 7 };
        Self {
            first_seen: now,
            last_seen: now,
            seen_count: 1,
            sources: vec![event.source_id.clone()],
            confidence: 0.5,
            priority,
            height: event.height,
        }
    }

    fn record_sighting(&mut self, event: &BlockEvent, now: Instant) {
        self.last_seen = now;
        self.seen_count = self.seen_count.saturating_add(1);
        if !self.sources.contains(&event.source_id) && self.sources.len() < MAX_SOURCES {
            self.sources.push(event.source_id.clone());
        }
        // Each corroborating source raises confidence toward 1
        self.confidence = (0.5 + 0.125 * (self.sources.len() as f64 - 1.0)).min(1.0);
        if !event.is_header_only {
            self.priority = self.priority.max(7);
            if self.height == 0 {
                self.height = event.height;
            }
        }
    }

    /// Retention score: the lowest-scoring record is evicted at capacity.
    /// Recently seen, well-corroborated, high-priority, frequently sighted
    /// records survive.
    fn keep_score(&self, now: Instant, base_ttl: Duration) -> f64 {
        let age = now.duration_since(self.last_seen).as_secs_f64();
        let recency = 1.0 - (age / base_ttl.as_secs_f64().max(0.001)).min(1.0);
        0.40 * recency
            + 0.25 * self.confidence
            + 0.20 * (self.priority as f64 / 10.0)
            + 0.15 * (self.seen_count.min(20) as f64 / 20.0)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DedupSummary {
    pub records: usize,
    pub max_size: usize,
    pub deferred_evictions: u64,
    pub networks: BTreeMap<String, NetworkStatsSnapshot>,
}

struct DedupInner {
    records: HashMap<(Chain, BlockHash), DedupeRecord>,
    stats: HashMap<Chain, NetworkStats>,
    deferred_evictions: u64,
}

/// Adaptive block deduplicator.
///
/// `check_and_record` performs the lookup and the record mutation under one
/// write acquisition, so two workers racing on the same hash cannot both see
/// `FirstSeen`.
pub struct Deduplicator {
    config: DedupConfig,
    base_max_size: usize,
    effective_max_size: AtomicUsize,
    inner: RwLock<DedupInner>,
    lock_table: HashLockTable,
    metrics: Option<Arc<RelayMetrics>>,
    closed: AtomicBool,
}

impl Deduplicator {
    pub fn new(config: DedupConfig) -> Self {
        let max_size = config.max_size_or_default();
        let dedup = Self {
            config,
            base_max_size: max_size,
            effective_max_size: AtomicUsize::new(max_size),
            inner: RwLock::new(DedupInner {
                records: HashMap::new(),
                stats: HashMap::new(),
                deferred_evictions: 0,
            }),
            lock_table: HashLockTable::new(),
            metrics: None,
            closed: AtomicBool::new(false),
        };
        dedup.apply_performance_mode(dedup.config.performance_mode);
        dedup
    }

    pub fn with_metrics(mut self, metrics: Arc<RelayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn base_ttl(&self) -> Duration {
        self.config.base_ttl()
    }

    /// First-seen check and record update in one lock acquisition
    pub fn check_and_record(&self, event: &BlockEvent) -> DedupeOutcome {
        self.check_and_record_at(event, Instant::now())
    }

    pub(crate) fn check_and_record_at(&self, event: &BlockEvent, now: Instant) -> DedupeOutcome {
        let key = event.dedupe_key();
        let base_ttl = self.config.base_ttl();
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());

        let stats = inner
            .stats
            .entry(event.chain)
            .or_insert_with(|| NetworkStats::new(event.chain));
        let ttl = stats.adaptive_ttl(base_ttl);

        let expired = inner
            .records
            .get(&key)
            .map(|record| now.duration_since(record.last_seen) > ttl)
            .unwrap_or(true);

        if !expired {
            if let Some(stats) = inner.stats.get_mut(&event.chain) {
                stats.record_duplicate();
            }
            if let Some(record) = inner.records.get_mut(&key) {
                record.record_sighting(event, now);
            }
            return DedupeOutcome::Duplicate;
        }

        if let Some(stats) = inner.stats.get_mut(&event.chain) {
            stats.record_first_seen(now);
        }
        inner.records.insert(key, DedupeRecord::new(event, now));

        let max_size = self.effective_max_size.load(Ordering::Relaxed);
        if inner.records.len() > max_size {
            self.evict_one(&mut inner, now, base_ttl);
        }

        if let Some(metrics) = &self.metrics {
            metrics.dedup_records.set(inner.records.len() as f64);
        }
        DedupeOutcome::FirstSeen
    }

    /// Evict the lowest-retention-score record, never touching entries seen
    /// within base_ttl/10. When everything is that young the insert stands
    /// and eviction is deferred; persistent deferral raises an alarm.
    fn evict_one(&self, inner: &mut DedupInner, now: Instant, base_ttl: Duration) {
        let young_threshold = base_ttl / 10;

        let victim = inner
            .records
            .iter()
            .filter(|(_, record)| now.duration_since(record.last_seen) >= young_threshold)
            .min_by(|(_, a), (_, b)| {
                a.keep_score(now, base_ttl)
                    .partial_cmp(&b.keep_score(now, base_ttl))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(key, _)| key.clone());

        match victim {
            Some(key) => {
                inner.records.remove(&key);
                if let Some(metrics) = &self.metrics {
                    metrics
                        .dedup_evictions_total
                        .with_label_values(&["capacity"])
                        .inc();
                }
            }
            None => {
                inner.deferred_evictions += 1;
                if inner.deferred_evictions % DEFERRAL_ALARM_THRESHOLD == 0 {
                    tracing::warn!(
                        records = inner.records.len(),
                        deferred = inner.deferred_evictions,
                        "Dedup table over capacity with only young records; eviction deferred"
                    );
                }
            }
        }
    }

    /// Periodic maintenance: TTL expiry, stats recompute, snapshot log
    pub fn sweep(&self) {
        self.sweep_at(Instant::now());
    }

    pub(crate) fn sweep_at(&self, now: Instant) {
        let base_ttl = self.config.base_ttl();
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());

        for stats in inner.stats.values_mut() {
            stats.recompute();
        }

        let ttls: HashMap<Chain, Duration> = inner
            .stats
            .iter()
            .map(|(chain, stats)| (*chain, stats.adaptive_ttl(base_ttl)))
            .collect();

        let before = inner.records.len();
        inner.records.retain(|(chain, _), record| {
            let ttl = ttls.get(chain).copied().unwrap_or(base_ttl);
            now.duration_since(record.last_seen) <= ttl
        });
        let expired = before - inner.records.len();

        if let Some(metrics) = &self.metrics {
            metrics.dedup_records.set(inner.records.len() as f64);
            if expired > 0 {
                metrics
                    .dedup_evictions_total
                    .with_label_values(&["ttl"])
                    .inc_by(expired as f64);
            }
            for (chain, stats) in &inner.stats {
                metrics
                    .dedup_adaptive_ttl_seconds
                    .with_label_values(&[chain.as_str()])
                    .set(stats.adaptive_ttl(base_ttl).as_secs_f64());
                metrics
                    .dedup_duplicate_rate
                    .with_label_values(&[chain.as_str()])
                    .set(stats.duplicate_rate);
            }
        }

        for (chain, stats) in &inner.stats {
            let snapshot = stats.snapshot(base_ttl);
            tracing::info!(
                chain = %chain,
                records = inner.records.len(),
                expired,
                avg_interblock_ms = snapshot.avg_interblock_ms,
                duplicate_rate = snapshot.duplicate_rate,
                adaptive_ttl_secs = snapshot.adaptive_ttl_secs,
                "Dedup stats"
            );
        }
    }

    /// Sweep loop; runs until close or shutdown
    pub async fn run_sweeper(
        self: Arc<Self>,
        mut shutdown: tokio::sync::broadcast::Receiver<()>,
    ) {
        let mut tick = tokio::time::interval(SWEEP_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if self.closed.load(Ordering::Relaxed) {
                        return;
                    }
                    self.sweep();
                }
                _ = shutdown.recv() => {
                    tracing::debug!("Dedup sweeper stopping");
                    return;
                }
            }
        }
    }

    pub fn stats(&self) -> DedupSummary {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let base_ttl = self.config.base_ttl();
        DedupSummary {
            records: inner.records.len(),
            max_size: self.effective_max_size.load(Ordering::Relaxed),
            deferred_evictions: inner.deferred_evictions,
            networks: inner
                .stats
                .iter()
                .map(|(chain, stats)| (chain.to_string(), stats.snapshot(base_ttl)))
                .collect(),
        }
    }

    pub fn set_performance_mode(&self, mode: PerformanceMode) {
        self.apply_performance_mode(mode);
        tracing::info!(?mode, "Dedup performance mode changed");
    }

    fn apply_performance_mode(&self, mode: PerformanceMode) {
        let (level, size_factor) = match mode {
            PerformanceMode::Standard => (2, 1.0),
            PerformanceMode::HighPerformance => (4, 2.0),
            PerformanceMode::MemoryOptimized => (1, 0.5),
            PerformanceMode::LatencyOptimized => (5, 1.0),
        };
        self.effective_max_size.store(
            ((self.base_max_size as f64 * size_factor) as usize).max(1),
            Ordering::Relaxed,
        );
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        for stats in inner.stats.values_mut() {
            stats.optimization_level = level;
        }
        // Chains seen later pick the level up from here
        for chain in Chain::ALL {
            inner
                .stats
                .entry(chain)
                .or_insert_with(|| NetworkStats::new(chain))
                .optimization_level = level;
        }
    }

    /// Advisory per-hash work claim for expensive fetches
    pub fn try_begin_work(&self, chain: Chain, hash: &BlockHash) -> Option<HashGuard<'_>> {
        self.lock_table.try_begin(chain, hash)
    }

    /// Record count currently held
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .records
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hashes currently held, for the warm-restart snapshot
    pub fn export_keys(&self) -> Vec<(Chain, BlockHash, u64)> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .records
            .iter()
            .map(|((chain, hash), record)| (*chain, hash.clone(), record.height))
            .collect()
    }

    /// Seed the table from a warm-restart snapshot. Entries age from load
    /// time; an inaccurate window beats re-emitting recent blocks.
    pub fn import_keys(&self, keys: Vec<(Chain, BlockHash, u64)>) {
        let now = Instant::now();
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        for (chain, hash, height) in keys {
            inner.records.entry((chain, hash)).or_insert(DedupeRecord {
                first_seen: now,
                last_seen: now,
                seen_count: 1,
                sources: Vec::new(),
                confidence: 0.5,
                priority: 5,
                height,
            });
        }
    }

    /// Idempotent close: stops background maintenance
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!("Deduplicator closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(chain: Chain, byte: u8, source: &str) -> BlockEvent {
        BlockEvent::new(chain, BlockHash::new(vec![byte; 32]), 100, source)
    }

    fn dedup(max_size: usize) -> Deduplicator {
        Deduplicator::new(DedupConfig {
            base_ttl_seconds: 300,
            max_size: Some(max_size),
            performance_mode: PerformanceMode::Standard,
        })
    }

    #[test]
    fn test_first_seen_then_duplicate() {
        let dedup = dedup(100);
        let e = event(Chain::Ethereum, 1, "a");
        assert_eq!(dedup.check_and_record(&e), DedupeOutcome::FirstSeen);
        assert_eq!(dedup.check_and_record(&e), DedupeOutcome::Duplicate);
    }

    #[test]
    fn test_replay_n_times_yields_one_first_seen() {
        let dedup = dedup(100);
        let e = event(Chain::Ethereum, 1, "a");
        let first_seen = (0..10)
            .filter(|_| dedup.check_and_record(&e) == DedupeOutcome::FirstSeen)
            .count();
        assert_eq!(first_seen, 1);
    }

    #[test]
    fn test_duplicate_across_sources_tracks_both() {
        let dedup = dedup(100);
        assert_eq!(
            dedup.check_and_record(&event(Chain::Ethereum, 1, "a")),
            DedupeOutcome::FirstSeen
        );
        assert_eq!(
            dedup.check_and_record(&event(Chain::Ethereum, 1, "b")),
            DedupeOutcome::Duplicate
        );
        let keys = dedup.export_keys();
        assert_eq!(keys.len(), 1);
        let inner = dedup.inner.read().unwrap();
        let record = inner.records.values().next().unwrap();
        assert_eq!(record.seen_count, 2);
        assert_eq!(record.sources.len(), 2);
        assert!(record.confidence > 0.5);
    }

    #[test]
    fn test_same_hash_different_chain_is_independent() {
        let dedup = dedup(100);
        assert_eq!(
            dedup.check_and_record(&event(Chain::Ethereum, 1, "a")),
            DedupeOutcome::FirstSeen
        );
        assert_eq!(
            dedup.check_and_record(&event(Chain::Bitcoin, 1, "a")),
            DedupeOutcome::FirstSeen
        );
    }

    #[test]
    fn test_expired_record_is_first_seen_again() {
        let dedup = dedup(100);
        let e = event(Chain::Ethereum, 1, "a");
        let start = Instant::now();
        assert_eq!(dedup.check_and_record_at(&e, start), DedupeOutcome::FirstSeen);
        // Far beyond the 3*base_ttl upper bound
        let later = start + Duration::from_secs(3_000);
        assert_eq!(dedup.check_and_record_at(&e, later), DedupeOutcome::FirstSeen);
    }

    #[test]
    fn test_capacity_eviction_removes_aged_record() {
        let dedup = dedup(2);
        let start = Instant::now();
        // Old enough to be evictable (base_ttl/10 = 30 s)
        dedup.check_and_record_at(&event(Chain::Ethereum, 1, "a"), start);
        let now = start + Duration::from_secs(60);
        dedup.check_and_record_at(&event(Chain::Ethereum, 2, "a"), now);
        dedup.check_and_record_at(&event(Chain::Ethereum, 3, "a"), now);
        assert_eq!(dedup.len(), 2);
        // The aged record went; the fresh ones remain
        let keys: Vec<u8> = dedup
            .export_keys()
            .iter()
            .map(|(_, hash, _)| hash.as_bytes()[0])
            .collect();
        assert!(!keys.contains(&1));
    }

    #[test]
    fn test_eviction_deferred_when_all_records_young() {
        let dedup = dedup(2);
        let now = Instant::now();
        dedup.check_and_record_at(&event(Chain::Ethereum, 1, "a"), now);
        dedup.check_and_record_at(&event(Chain::Ethereum, 2, "a"), now);
        dedup.check_and_record_at(&event(Chain::Ethereum, 3, "a"), now);
        // Nothing was old enough to evict; the insert stands
        assert_eq!(dedup.len(), 3);
        assert_eq!(dedup.stats().deferred_evictions, 1);
    }

    #[test]
    fn test_sweep_expires_by_ttl() {
        let dedup = dedup(100);
        let start = Instant::now();
        dedup.check_and_record_at(&event(Chain::Ethereum, 1, "a"), start);
        dedup.sweep_at(start + Duration::from_secs(3_000));
        assert!(dedup.is_empty());
    }

    #[test]
    fn test_performance_mode_scales_capacity() {
        let dedup = dedup(1_000);
        dedup.set_performance_mode(PerformanceMode::MemoryOptimized);
        assert_eq!(dedup.stats().max_size, 500);
        dedup.set_performance_mode(PerformanceMode::HighPerformance);
        assert_eq!(dedup.stats().max_size, 2_000);
    }

    #[test]
    fn test_close_is_idempotent() {
        let dedup = dedup(100);
        dedup.close();
        dedup.close();
        assert!(dedup.is_closed());
    }

    #[test]
    fn test_import_export_round_trip() {
        let original = dedup(100);
        original.check_and_record(&event(Chain::Ethereum, 1, "a"));
        let keys = original.export_keys();

        let restored = dedup(100);
        restored.import_keys(keys);
        // The replayed block stays suppressed after a warm restart
        assert_eq!(
            restored.check_and_record(&event(Chain::Ethereum, 1, "a")),
            DedupeOutcome::Duplicate
        );
    }

    #[test]
    fn test_concurrent_check_yields_single_first_seen() {
        let dedup = Arc::new(dedup(100));
        let mut handles = Vec::new();
        for i in 0..8 {
            let dedup = dedup.clone();
            handles.push(std::thread::spawn(move || {
                let e = event(Chain::Ethereum, 9, &format!("src-{}", i));
                dedup.check_and_record(&e)
            }));
        }
        let first_seen = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|o| *o == DedupeOutcome::FirstSeen)
            .count();
        assert_eq!(first_seen, 1);
    }
}
