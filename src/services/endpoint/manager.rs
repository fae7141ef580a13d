use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};

use crate::config::relay_config::HealthConfig;
use crate::services::endpoint::health::{endpoint_score, EndpointMetrics, EndpointStatus};
use crate::services::endpoint::registry::{EndpointRegistry, NodeEndpoint};
use crate::services::event::{Chain, Transport};
use crate::services::metrics::RelayMetrics;

#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("No healthy {transport} endpoint for {chain}")]
    NoHealthyEndpoint { chain: Chain, transport: Transport },
    #[error("Unknown endpoint: {0}")]
    UnknownEndpoint(String),
}

/// Health state change, broadcast to adapters holding persistent connections
/// so they can drop and reopen. One-way: the manager owns endpoints, adapters
/// only listen.
#[derive(Debug, Clone)]
pub struct HealthTransition {
    pub endpoint_id: String,
    pub chain: Chain,
    pub transport: Transport,
    pub is_healthy: bool,
}

#[derive(Debug, Clone)]
struct ScoredEntry {
    endpoint: Arc<NodeEndpoint>,
    score: f64,
    ema_latency_ms: f64,
    is_healthy: bool,
}

/// Immutable selection snapshot; selection reads never take the metrics lock
#[derive(Debug, Default)]
struct SelectionSnapshot {
    by_slot: HashMap<(Chain, Transport), Vec<ScoredEntry>>,
}

#[derive(Debug, Clone)]
struct StickyChoice {
    endpoint_id: String,
    chosen_at: Instant,
}

/// Owns every `NodeEndpoint`'s runtime state and answers "best endpoint for
/// transport T" from a pre-scored snapshot.
pub struct ConnectionManager {
    registry: Arc<EndpointRegistry>,
    config: HealthConfig,
    metrics: RwLock<HashMap<String, EndpointMetrics>>,
    snapshot_tx: watch::Sender<Arc<SelectionSnapshot>>,
    snapshot_rx: watch::Receiver<Arc<SelectionSnapshot>>,
    transition_tx: broadcast::Sender<HealthTransition>,
    sticky: Mutex<HashMap<(Chain, Transport), StickyChoice>>,
    relay_metrics: Option<Arc<RelayMetrics>>,
}

impl ConnectionManager {
    pub fn new(registry: Arc<EndpointRegistry>, config: HealthConfig) -> Self {
        let mut metrics = HashMap::new();
        for endpoint in registry.all() {
            metrics.insert(endpoint.id.clone(), EndpointMetrics::new());
        }

        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(SelectionSnapshot::default()));
        let (transition_tx, _) = broadcast::channel(64);

        let manager = Self {
            registry,
            config,
            metrics: RwLock::new(metrics),
            snapshot_tx,
            snapshot_rx,
            transition_tx,
            sticky: Mutex::new(HashMap::new()),
            relay_metrics: None,
        };
        manager.rebuild_snapshot();
        manager
    }

    pub fn with_relay_metrics(mut self, relay_metrics: Arc<RelayMetrics>) -> Self {
        self.relay_metrics = Some(relay_metrics);
        self
    }

    pub fn registry(&self) -> &EndpointRegistry {
        &self.registry
    }

    /// Subscribe to health transitions
    pub fn transitions(&self) -> broadcast::Receiver<HealthTransition> {
        self.transition_tx.subscribe()
    }

    /// Highest-scoring healthy endpoint for the slot.
    ///
    /// A selection stays sticky for the configured window to avoid flapping
    /// between equally-scored endpoints, but stickiness is abandoned the
    /// moment the cached choice turns unhealthy.
    pub fn get_best(
        &self,
        chain: Chain,
        transport: Transport,
    ) -> Result<Arc<NodeEndpoint>, EndpointError> {
        let snapshot = self.snapshot_rx.borrow().clone();
        let entries = snapshot
            .by_slot
            .get(&(chain, transport))
            .map(Vec::as_slice)
            .unwrap_or(&[]);

        let healthy: Vec<&ScoredEntry> = entries.iter().filter(|e| e.is_healthy).collect();
        if healthy.is_empty() {
            return Err(EndpointError::NoHealthyEndpoint { chain, transport });
        }

        let mut sticky = self.sticky.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(choice) = sticky.get(&(chain, transport)) {
            if choice.chosen_at.elapsed() < self.config.sticky_window() {
                if let Some(entry) = healthy.iter().find(|e| e.endpoint.id == choice.endpoint_id) {
                    return Ok(entry.endpoint.clone());
                }
            }
        }

        // Entries are pre-sorted best-first
        let best = healthy[0].endpoint.clone();
        sticky.insert(
            (chain, transport),
            StickyChoice {
                endpoint_id: best.id.clone(),
                chosen_at: Instant::now(),
            },
        );
        Ok(best)
    }

    pub fn list_healthy(&self, chain: Chain) -> Vec<Arc<NodeEndpoint>> {
        let snapshot = self.snapshot_rx.borrow().clone();
        let mut result = Vec::new();
        for ((entry_chain, _), entries) in &snapshot.by_slot {
            if *entry_chain == chain {
                result.extend(
                    entries
                        .iter()
                        .filter(|e| e.is_healthy)
                        .map(|e| e.endpoint.clone()),
                );
            }
        }
        result
    }

    /// Record one request or probe outcome. Updates EMA latency and counters,
    /// applies the consecutive-failure health rule, and refreshes the
    /// selection snapshot.
    pub fn report_result(&self, endpoint_id: &str, latency: Duration, success: bool) {
        let endpoint = match self.registry.get(endpoint_id) {
            Some(ep) => ep,
            None => {
                tracing::warn!(endpoint = endpoint_id, "Result for unknown endpoint ignored");
                return;
            }
        };

        let transition = {
            let mut metrics = self.metrics.write().unwrap_or_else(|e| e.into_inner());
            let entry = metrics.entry(endpoint_id.to_string()).or_default();
            if success {
                entry.record_success(latency);
            } else {
                entry.record_failure(latency);
            }

            let should_be_healthy = if success {
                // Any successful probe flips the endpoint back
                true
            } else {
                entry.consecutive_failures < self.config.max_failures_before_down
            };
            entry.set_healthy(should_be_healthy).then(|| HealthTransition {
                endpoint_id: endpoint.id.clone(),
                chain: endpoint.chain,
                transport: endpoint.transport,
                is_healthy: should_be_healthy,
            })
        };

        if let Some(transition) = transition {
            if transition.is_healthy {
                tracing::info!(endpoint = %transition.endpoint_id, chain = %transition.chain, "Endpoint recovered");
            } else {
                tracing::warn!(endpoint = %transition.endpoint_id, chain = %transition.chain, "Endpoint marked unhealthy");
            }
            // Stickiness must not outlive health
            self.sticky
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .retain(|_, choice| choice.endpoint_id != transition.endpoint_id);
            let _ = self.transition_tx.send(transition);
        }

        if let Some(relay_metrics) = &self.relay_metrics {
            let status = if success { "success" } else { "failure" };
            relay_metrics
                .endpoint_requests_total
                .with_label_values(&[endpoint.chain.as_str(), &endpoint.id, status])
                .inc();
        }

        self.rebuild_snapshot();
    }

    /// Seed health state from a warm-restart snapshot. The next probe round
    /// overrides this; it only shapes selection until then.
    pub fn restore_health(&self, endpoint_id: &str, healthy: bool) {
        {
            let mut metrics = self.metrics.write().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = metrics.get_mut(endpoint_id) {
                entry.set_healthy(healthy);
            }
        }
        self.rebuild_snapshot();
    }

    /// Status summary for the operational surface
    pub fn endpoint_statuses(&self, chain: Chain) -> Vec<EndpointStatus> {
        let metrics = self.metrics.read().unwrap_or_else(|e| e.into_inner());
        self.registry
            .for_chain(chain)
            .iter()
            .map(|endpoint| {
                let m = metrics.get(&endpoint.id).cloned().unwrap_or_default();
                EndpointStatus {
                    id: endpoint.id.clone(),
                    chain: endpoint.chain,
                    transport: endpoint.transport,
                    url: endpoint.url.clone(),
                    is_healthy: m.is_healthy,
                    score: endpoint_score(endpoint, &m, self.config.latency_weight),
                    ema_latency_ms: m.ema_latency_ms,
                    error_rate: m.error_rate(),
                    success_count: m.success_count,
                    failure_count: m.failure_count,
                }
            })
            .collect()
    }

    pub fn is_healthy(&self, endpoint_id: &str) -> bool {
        self.metrics
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(endpoint_id)
            .map(|m| m.is_healthy)
            .unwrap_or(false)
    }

    /// True when at least one endpoint of the chain is healthy
    pub fn has_healthy_endpoint(&self, chain: Chain) -> bool {
        !self.list_healthy(chain).is_empty()
    }

    /// Startup gate: endpoints begin optimistically healthy, so readiness
    /// requires a healthy endpoint with at least one successful probe behind it
    pub fn has_proven_endpoint(&self, chain: Chain) -> bool {
        let metrics = self.metrics.read().unwrap_or_else(|e| e.into_inner());
        self.registry.for_chain(chain).iter().any(|ep| {
            metrics
                .get(&ep.id)
                .map(|m| m.is_healthy && m.success_count > 0)
                .unwrap_or(false)
        })
    }

    fn rebuild_snapshot(&self) {
        let metrics = self.metrics.read().unwrap_or_else(|e| e.into_inner());
        let mut by_slot: HashMap<(Chain, Transport), Vec<ScoredEntry>> = HashMap::new();

        for endpoint in self.registry.all() {
            let m = match metrics.get(&endpoint.id) {
                Some(m) => m,
                None => continue,
            };
            let score = endpoint_score(endpoint, m, self.config.latency_weight);
            if let Some(relay_metrics) = &self.relay_metrics {
                relay_metrics
                    .endpoint_health_score
                    .with_label_values(&[endpoint.chain.as_str(), &endpoint.id])
                    .set(score);
                relay_metrics
                    .endpoint_healthy
                    .with_label_values(&[endpoint.chain.as_str(), &endpoint.id])
                    .set(if m.is_healthy { 1.0 } else { 0.0 });
            }
            by_slot
                .entry((endpoint.chain, endpoint.transport))
                .or_default()
                .push(ScoredEntry {
                    endpoint: endpoint.clone(),
                    score,
                    ema_latency_ms: m.ema_latency_ms,
                    is_healthy: m.is_healthy,
                });
        }
        drop(metrics);

        for entries in by_slot.values_mut() {
            entries.sort_by(|a, b| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    // Lower EMA latency wins ties, then lexicographic URL
                    .then_with(|| {
                        a.ema_latency_ms
                            .partial_cmp(&b.ema_latency_ms)
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .then_with(|| a.endpoint.url.cmp(&b.endpoint.url))
            });
        }

        let _ = self.snapshot_tx.send(Arc::new(SelectionSnapshot { by_slot }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::relay_config::{EndpointConfig, RelayConfig};
    use crate::config::relay_config::{
        CacheConfig, CircuitConfig, DedupConfig, PipelineConfig, Tier,
    };

    fn test_manager(urls: &[(&str, u8)]) -> ConnectionManager {
        let mut endpoints = HashMap::new();
        endpoints.insert(
            Chain::Ethereum,
            urls.iter()
                .map(|(url, priority)| EndpointConfig {
                    url: url.to_string(),
                    transport: Transport::Rpc,
                    priority: *priority,
                    region: None,
                    provider: None,
                })
                .collect(),
        );
        let config = RelayConfig {
            chains: vec![Chain::Ethereum],
            endpoints,
            tier: Tier::Business,
            dedup: DedupConfig::default(),
            health: HealthConfig::default(),
            circuit: CircuitConfig::default(),
            cache: CacheConfig::default(),
            pipeline: PipelineConfig::default(),
        };
        let registry = Arc::new(EndpointRegistry::from_config(&config));
        ConnectionManager::new(registry, HealthConfig::default())
    }

    #[test]
    fn test_get_best_prefers_static_priority() {
        let manager = test_manager(&[("https://a.example.com", 5), ("https://b.example.com", 1)]);
        let best = manager.get_best(Chain::Ethereum, Transport::Rpc).unwrap();
        assert_eq!(best.url, "https://b.example.com");
    }

    #[test]
    fn test_unhealthy_endpoint_excluded_after_threshold() {
        let manager = test_manager(&[("https://a.example.com", 1), ("https://b.example.com", 5)]);

        // Default max_failures_before_down is 3
        for _ in 0..3 {
            manager.report_result("https://a.example.com", Duration::from_millis(50), false);
        }
        assert!(!manager.is_healthy("https://a.example.com"));

        let best = manager.get_best(Chain::Ethereum, Transport::Rpc).unwrap();
        assert_eq!(best.url, "https://b.example.com");

        // A single successful probe flips it back
        manager.report_result("https://a.example.com", Duration::from_millis(50), true);
        assert!(manager.is_healthy("https://a.example.com"));
    }

    #[test]
    fn test_no_healthy_endpoint_error() {
        let manager = test_manager(&[("https://a.example.com", 1)]);
        for _ in 0..3 {
            manager.report_result("https://a.example.com", Duration::from_millis(50), false);
        }
        assert!(matches!(
            manager.get_best(Chain::Ethereum, Transport::Rpc),
            Err(EndpointError::NoHealthyEndpoint { .. })
        ));
    }

    #[test]
    fn test_two_failures_do_not_remove_endpoint() {
        let manager = test_manager(&[("https://a.example.com", 1)]);
        for _ in 0..2 {
            manager.report_result("https://a.example.com", Duration::from_millis(50), false);
        }
        assert!(manager.is_healthy("https://a.example.com"));
        assert!(manager.get_best(Chain::Ethereum, Transport::Rpc).is_ok());
    }

    #[test]
    fn test_sticky_selection_abandoned_on_unhealth() {
        let manager = test_manager(&[("https://a.example.com", 1), ("https://b.example.com", 5)]);

        let first = manager.get_best(Chain::Ethereum, Transport::Rpc).unwrap();
        assert_eq!(first.url, "https://a.example.com");

        for _ in 0..3 {
            manager.report_result("https://a.example.com", Duration::from_millis(50), false);
        }
        // Sticky window has not elapsed, but the choice is gone
        let second = manager.get_best(Chain::Ethereum, Transport::Rpc).unwrap();
        assert_eq!(second.url, "https://b.example.com");
    }

    #[test]
    fn test_transition_broadcast() {
        let manager = test_manager(&[("https://a.example.com", 1)]);
        let mut rx = manager.transitions();
        for _ in 0..3 {
            manager.report_result("https://a.example.com", Duration::from_millis(50), false);
        }
        let transition = rx.try_recv().unwrap();
        assert!(!transition.is_healthy);
        assert_eq!(transition.endpoint_id, "https://a.example.com");
    }

    #[test]
    fn test_list_healthy() {
        let manager = test_manager(&[("https://a.example.com", 1), ("https://b.example.com", 5)]);
        assert_eq!(manager.list_healthy(Chain::Ethereum).len(), 2);
        for _ in 0..3 {
            manager.report_result("https://b.example.com", Duration::from_millis(50), false);
        }
        let healthy = manager.list_healthy(Chain::Ethereum);
        assert_eq!(healthy.len(), 1);
        assert_eq!(healthy[0].url, "https://a.example.com");
    }
}
