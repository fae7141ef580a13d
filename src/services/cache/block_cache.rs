use lru::LruCache;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

use crate::config::relay_config::{CacheConfig, CircuitConfig};
use crate::services::event::{BlockEvent, BlockHash, Chain};
use crate::services::metrics::RelayMetrics;
use crate::services::resilience::{BreakerError, CircuitBreaker};

/// Per-key breaker map is pruned once it grows past this
const MAX_TRACKED_BREAKERS: usize = 1024;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error("Circuit open for cache fill")]
    CircuitOpen,
    #[error("Cache fill failed: {0}")]
    Fill(String),
    #[error("Value of {size} bytes exceeds cache capacity")]
    RejectedOversize { size: u64 },
}

#[derive(Debug)]
struct CacheEntry {
    value: Arc<Value>,
    expires_at: Instant,
    size_bytes: u64,
}

struct CacheInner {
    lru: LruCache<String, CacheEntry>,
    total_bytes: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    rejected_oversize: u64,
    single_flight_joins: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub rejected_oversize: u64,
    pub single_flight_joins: u64,
}

type FillResult = Result<Arc<Value>, CacheError>;

/// LRU + TTL cache fronting downstream reads of recent blocks.
///
/// Misses are single-flighted: any number of concurrent callers for the same
/// absent key produce exactly one upstream fill, guarded by a per-key circuit
/// breaker.
pub struct BlockCache {
    config: CacheConfig,
    max_entries: usize,
    inner: Mutex<CacheInner>,
    inflight: tokio::sync::Mutex<HashMap<String, broadcast::Sender<FillResult>>>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    breaker_config: CircuitConfig,
    metrics: Option<Arc<RelayMetrics>>,
}

impl BlockCache {
    pub fn new(config: CacheConfig, breaker_config: CircuitConfig) -> Self {
        let max_entries = config.max_entries.unwrap_or(10_000).max(1);
        Self {
            max_entries,
            inner: Mutex::new(CacheInner {
                // Unbounded internally: both capacity limits are enforced in
                // `set` so evictions stay visible to the byte accounting
                lru: LruCache::unbounded(),
                total_bytes: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
                rejected_oversize: 0,
                single_flight_joins: 0,
            }),
            inflight: tokio::sync::Mutex::new(HashMap::new()),
            breakers: Mutex::new(HashMap::new()),
            breaker_config,
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<RelayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Cache key for a block by identity hash
    pub fn hash_key(chain: Chain, hash: &BlockHash) -> String {
        format!("{}:hash:{}", chain, hash)
    }

    /// Cache key for a block by height
    pub fn height_key(chain: Chain, height: u64) -> String {
        format!("{}:height:{}", chain, height)
    }

    /// O(1) lookup; promotes the entry and enforces its TTL
    pub fn get(&self, key: &str) -> Option<Arc<Value>> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();

        let expired = match inner.lru.get(key) {
            Some(entry) if entry.expires_at > now => {
                let value = entry.value.clone();
                inner.hits += 1;
                self.count_op("get", "hit");
                return Some(value);
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            if let Some(entry) = inner.lru.pop(key) {
                inner.total_bytes = inner.total_bytes.saturating_sub(entry.size_bytes);
                inner.evictions += 1;
                self.count_eviction("ttl");
            }
        }
        inner.misses += 1;
        self.count_op("get", "miss");
        self.publish_gauges(&inner);
        None
    }

    /// Insert or update; evicts LRU entries to respect both capacity bounds
    pub fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), CacheError> {
        let size = estimate_size(&value);
        if size > self.config.max_bytes {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.rejected_oversize += 1;
            self.count_op("set", "rejected_oversize");
            return Err(CacheError::RejectedOversize { size });
        }

        let ttl = ttl.unwrap_or_else(|| self.config.default_ttl());
        let entry = CacheEntry {
            value: Arc::new(value),
            expires_at: Instant::now() + ttl,
            size_bytes: size,
        };

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = inner.lru.put(key.to_string(), entry) {
            inner.total_bytes = inner.total_bytes.saturating_sub(old.size_bytes);
        }
        inner.total_bytes += size;

        while inner.total_bytes > self.config.max_bytes || inner.lru.len() > self.max_entries {
            match inner.lru.pop_lru() {
                Some((_, evicted)) => {
                    inner.total_bytes = inner.total_bytes.saturating_sub(evicted.size_bytes);
                    inner.evictions += 1;
                    self.count_eviction("capacity");
                }
                None => break,
            }
        }

        self.count_op("set", "ok");
        self.publish_gauges(&inner);
        Ok(())
    }

    pub fn invalidate(&self, key: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = inner.lru.pop(key) {
            inner.total_bytes = inner.total_bytes.saturating_sub(entry.size_bytes);
            self.count_op("invalidate", "ok");
        }
        self.publish_gauges(&inner);
    }

    /// Pipeline write: store the processed event under both identity keys,
    /// replacing anything stale
    pub fn insert_block(&self, event: &BlockEvent) -> Result<(), CacheError> {
        let payload = serde_json::to_value(event).map_err(|e| CacheError::Fill(e.to_string()))?;
        self.set(&Self::hash_key(event.chain, &event.hash), payload.clone(), None)?;
        if event.height > 0 {
            self.set(&Self::height_key(event.chain, event.height), payload, None)?;
        }
        Ok(())
    }

    /// Read-through with single-flight: at most one concurrent `fill` per
    /// absent key; every other caller awaits the shared outcome
    pub async fn get_or_fill<F, Fut>(&self, key: &str, fill: F) -> FillResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, String>>,
    {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }

        let mut rx = {
            let mut inflight = self.inflight.lock().await;
            // A racing caller may have completed the fill while we waited
            if let Some(value) = self.get(key) {
                return Ok(value);
            }
            match inflight.get(key) {
                Some(tx) => {
                    let rx = tx.subscribe();
                    {
                        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                        inner.single_flight_joins += 1;
                        if let Some(metrics) = &self.metrics {
                            metrics
                                .cache_single_flight_joins_total
                                .set(inner.single_flight_joins as f64);
                        }
                    }
                    Some(rx)
                }
                None => {
                    let (tx, _) = broadcast::channel(1);
                    inflight.insert(key.to_string(), tx);
                    None
                }
            }
        };

        if let Some(rx) = rx.as_mut() {
            return match rx.recv().await {
                Ok(result) => result,
                // Filler dropped without broadcasting; treat as a failed fill
                Err(_) => Err(CacheError::Fill("fill aborted".into())),
            };
        }

        let breaker = self.breaker_for(key);
        let result: FillResult = match breaker.call(fill).await {
            Ok(value) => match self.set(key, value.clone(), None) {
                Ok(()) => Ok(Arc::new(value)),
                Err(err) => Err(err),
            },
            Err(BreakerError::CircuitOpen) => Err(CacheError::CircuitOpen),
            Err(BreakerError::Inner(message)) => Err(CacheError::Fill(message)),
        };

        let mut inflight = self.inflight.lock().await;
        if let Some(tx) = inflight.remove(key) {
            let _ = tx.send(result.clone());
        }
        result
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        CacheStats {
            entries: inner.lru.len(),
            total_bytes: inner.total_bytes,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            rejected_oversize: inner.rejected_oversize,
            single_flight_joins: inner.single_flight_joins,
        }
    }

    /// Final metrics flush on shutdown
    pub fn flush_metrics(&self) {
        let stats = self.stats();
        tracing::info!(
            entries = stats.entries,
            bytes = stats.total_bytes,
            hits = stats.hits,
            misses = stats.misses,
            evictions = stats.evictions,
            "Block cache final stats"
        );
    }

    fn breaker_for(&self, key: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        if breakers.len() > MAX_TRACKED_BREAKERS {
            // Bounded table: reset rather than grow without limit
            tracing::debug!(tracked = breakers.len(), "Pruning cache fill breakers");
            breakers.clear();
        }
        breakers
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    format!("cache-fill:{}", key),
                    self.breaker_config.breaker_config(),
                ))
            })
            .clone()
    }

    fn count_op(&self, operation: &str, result: &str) {
        if let Some(metrics) = &self.metrics {
            metrics
                .cache_operations_total
                .with_label_values(&[operation, result])
                .inc();
        }
    }

    fn count_eviction(&self, reason: &str) {
        if let Some(metrics) = &self.metrics {
            metrics
                .cache_evictions_total
                .with_label_values(&[reason])
                .inc();
        }
    }

    fn publish_gauges(&self, inner: &CacheInner) {
        if let Some(metrics) = &self.metrics {
            metrics.cache_entries.set(inner.lru.len() as f64);
            metrics.cache_bytes.set(inner.total_bytes as f64);
        }
    }
}

/// Serialized JSON length as the byte-accounting proxy
fn estimate_size(value: &Value) -> u64 {
    value.to_string().len() as u64
}
