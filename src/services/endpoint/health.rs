use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::relay_config::HealthConfig;
use crate::services::endpoint::manager::ConnectionManager;
use crate::services::endpoint::registry::NodeEndpoint;
use crate::services::event::{Chain, Transport};

/// EMA smoothing factor for request latency
const LATENCY_EMA_ALPHA: f64 = 0.1;
/// Latency above this is scored as fully degraded
const MAX_ACCEPTABLE_LATENCY_MS: f64 = 5_000.0;
/// Outcomes considered for the recent-success component of the score
const RECENT_OUTCOME_WINDOW: usize = 20;

/// Runtime health state for one endpoint. Mutated only by the health checker
/// and the request-path result reporter, both through the manager.
#[derive(Debug, Clone)]
pub struct EndpointMetrics {
    pub is_healthy: bool,
    pub last_check: Option<Instant>,
    pub consecutive_failures: u32,
    pub failure_count: u64,
    pub success_count: u64,
    pub ema_latency_ms: f64,
    recent_outcomes: VecDeque<bool>,
    created_at: Instant,
    healthy_since: Option<Instant>,
    healthy_accum: Duration,
}

impl EndpointMetrics {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            // Endpoints start healthy; the first probes decide otherwise
            is_healthy: true,
            last_check: None,
            consecutive_failures: 0,
            failure_count: 0,
            success_count: 0,
            ema_latency_ms: 0.0,
            recent_outcomes: VecDeque::with_capacity(RECENT_OUTCOME_WINDOW),
            created_at: now,
            healthy_since: Some(now),
            healthy_accum: Duration::ZERO,
        }
    }

    pub fn record_success(&mut self, latency: Duration) {
        self.success_count += 1;
        self.consecutive_failures = 0;
        self.last_check = Some(Instant::now());
        self.update_latency(latency);
        self.push_outcome(true);
    }

    pub fn record_failure(&mut self, latency: Duration) {
        self.failure_count += 1;
        self.consecutive_failures += 1;
        self.last_check = Some(Instant::now());
        self.update_latency(latency);
        self.push_outcome(false);
    }

    /// Flip health state, keeping the uptime accounting consistent.
    /// Returns true when the state actually changed.
    pub fn set_healthy(&mut self, healthy: bool) -> bool {
        if self.is_healthy == healthy {
            return false;
        }
        let now = Instant::now();
        if healthy {
            self.healthy_since = Some(now);
        } else if let Some(since) = self.healthy_since.take() {
            self.healthy_accum += now.duration_since(since);
        }
        self.is_healthy = healthy;
        true
    }

    fn update_latency(&mut self, latency: Duration) {
        let sample = latency.as_secs_f64() * 1_000.0;
        if self.ema_latency_ms == 0.0 {
            self.ema_latency_ms = sample;
        } else {
            self.ema_latency_ms =
                LATENCY_EMA_ALPHA * sample + (1.0 - LATENCY_EMA_ALPHA) * self.ema_latency_ms;
        }
    }

    fn push_outcome(&mut self, success: bool) {
        if self.recent_outcomes.len() >= RECENT_OUTCOME_WINDOW {
            self.recent_outcomes.pop_front();
        }
        self.recent_outcomes.push_back(success);
    }

    pub fn error_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            0.0
        } else {
            self.failure_count as f64 / total as f64
        }
    }

    /// Fraction of process lifetime this endpoint spent healthy
    pub fn uptime_frac(&self) -> f64 {
        let lifetime = self.created_at.elapsed();
        if lifetime.is_zero() {
            return 1.0;
        }
        let mut healthy = self.healthy_accum;
        if let Some(since) = self.healthy_since {
            healthy += since.elapsed();
        }
        (healthy.as_secs_f64() / lifetime.as_secs_f64()).min(1.0)
    }

    pub fn recent_success_frac(&self) -> f64 {
        if self.recent_outcomes.is_empty() {
            return 1.0;
        }
        let successes = self.recent_outcomes.iter().filter(|&&ok| ok).count();
        successes as f64 / self.recent_outcomes.len() as f64
    }
}

impl Default for EndpointMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Composite selection score; derived per selection, never persisted
pub fn endpoint_score(endpoint: &NodeEndpoint, metrics: &EndpointMetrics, latency_weight: f64) -> f64 {
    let priority_norm = (11.0 - endpoint.static_priority as f64) / 10.0;
    let latency_norm = 1.0 - (metrics.ema_latency_ms / MAX_ACCEPTABLE_LATENCY_MS).min(1.0);

    0.20 * priority_norm
        + latency_weight * latency_norm
        + 0.15 * (1.0 - metrics.error_rate())
        + 0.10 * metrics.uptime_frac()
        + 0.05 * metrics.recent_success_frac()
}

/// Serializable endpoint summary for the status surface
#[derive(Debug, Serialize)]
pub struct EndpointStatus {
    pub id: String,
    pub chain: Chain,
    pub transport: Transport,
    pub url: String,
    pub is_healthy: bool,
    pub score: f64,
    pub ema_latency_ms: f64,
    pub error_rate: f64,
    pub success_count: u64,
    pub failure_count: u64,
}

/// Background prober feeding `EndpointMetrics` through the manager.
///
/// Probes are deliberately shallow: a cheap RPC request for HTTP endpoints
/// and a TCP dial for WS/P2P. Full handshakes are the adapters' job.
pub struct HealthChecker {
    manager: Arc<ConnectionManager>,
    config: HealthConfig,
    client: reqwest::Client,
}

impl HealthChecker {
    pub fn new(manager: Arc<ConnectionManager>, config: HealthConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.probe_timeout())
            .build()
            .unwrap_or_default();
        Self {
            manager,
            config,
            client,
        }
    }

    /// Probe loop; runs until the shutdown signal fires
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        let mut tick = tokio::time::interval(self.config.check_interval());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.probe_all().await;
                }
                _ = shutdown.recv() => {
                    tracing::debug!("Health checker stopping");
                    return;
                }
            }
        }
    }

    /// Probe every registered endpoint concurrently
    pub async fn probe_all(&self) {
        let endpoints: Vec<Arc<NodeEndpoint>> = self.manager.registry().all().to_vec();

        let probes = endpoints.into_iter().map(|endpoint| {
            let checker = self;
            async move {
                let started = Instant::now();
                let success = checker.probe(&endpoint).await;
                let latency = started.elapsed();
                checker
                    .manager
                    .report_result(&endpoint.id, latency, success);
            }
        });

        futures::future::join_all(probes).await;
    }

    async fn probe(&self, endpoint: &NodeEndpoint) -> bool {
        let result = tokio::time::timeout(self.config.probe_timeout(), async {
            match endpoint.transport {
                Transport::Rpc => self.probe_rpc(endpoint).await,
                // TCP dial-connect only; the adapter owns the real handshake
                Transport::Ws | Transport::P2p => self.probe_tcp(endpoint).await,
            }
        })
        .await;

        match result {
            Ok(ok) => ok,
            Err(_) => {
                tracing::debug!(endpoint = %endpoint.id, "Health probe timed out");
                false
            }
        }
    }

    async fn probe_rpc(&self, endpoint: &NodeEndpoint) -> bool {
        let method = Self::probe_method(endpoint.chain);
        let payload = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": [],
            "id": 1
        });

        let response = match self.client.post(&endpoint.url).json(&payload).send().await {
            Ok(resp) => resp,
            Err(err) => {
                tracing::debug!(endpoint = %endpoint.id, error = %err, "Health probe failed");
                return false;
            }
        };

        if !response.status().is_success() {
            return false;
        }

        // Well-formed JSON-RPC response with a result field
        match response.json::<serde_json::Value>().await {
            Ok(body) => body.get("result").is_some(),
            Err(_) => false,
        }
    }

    async fn probe_tcp(&self, endpoint: &NodeEndpoint) -> bool {
        let addr = match Self::dial_target(endpoint) {
            Some(addr) => addr,
            None => return false,
        };
        match tokio::net::TcpStream::connect(&addr).await {
            Ok(stream) => {
                drop(stream);
                true
            }
            Err(err) => {
                tracing::debug!(endpoint = %endpoint.id, error = %err, "TCP probe failed");
                false
            }
        }
    }

    /// Cheap, well-known request per chain
    fn probe_method(chain: Chain) -> &'static str {
        match chain {
            Chain::Ethereum => "eth_blockNumber",
            Chain::Bitcoin => "getblockcount",
            Chain::Solana => "getHealth",
        }
    }

    /// host:port to dial for WS/P2P probes
    fn dial_target(endpoint: &NodeEndpoint) -> Option<String> {
        match endpoint.transport {
            Transport::P2p => Some(endpoint.url.clone()),
            Transport::Ws => {
                let stripped = endpoint
                    .url
                    .trim_start_matches("wss://")
                    .trim_start_matches("ws://");
                let host_port = stripped.split('/').next()?;
                if host_port.contains(':') {
                    Some(host_port.to_string())
                } else {
                    let port = if endpoint.url.starts_with("wss://") { 443 } else { 80 };
                    Some(format!("{}:{}", host_port, port))
                }
            }
            Transport::Rpc => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(priority: u8) -> NodeEndpoint {
        NodeEndpoint {
            id: "https://rpc.example.com".into(),
            chain: Chain::Ethereum,
            transport: Transport::Rpc,
            url: "https://rpc.example.com".into(),
            static_priority: priority,
            region: None,
            provider: None,
        }
    }

    #[test]
    fn test_ema_latency_smooths() {
        let mut metrics = EndpointMetrics::new();
        metrics.record_success(Duration::from_millis(100));
        assert!((metrics.ema_latency_ms - 100.0).abs() < 1e-9);

        metrics.record_success(Duration::from_millis(200));
        // 0.1 * 200 + 0.9 * 100
        assert!((metrics.ema_latency_ms - 110.0).abs() < 1e-9);
    }

    #[test]
    fn test_error_rate() {
        let mut metrics = EndpointMetrics::new();
        for _ in 0..3 {
            metrics.record_success(Duration::from_millis(10));
        }
        metrics.record_failure(Duration::from_millis(10));
        assert!((metrics.error_rate() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_consecutive_failures_reset_on_success() {
        let mut metrics = EndpointMetrics::new();
        metrics.record_failure(Duration::from_millis(10));
        metrics.record_failure(Duration::from_millis(10));
        assert_eq!(metrics.consecutive_failures, 2);
        metrics.record_success(Duration::from_millis(10));
        assert_eq!(metrics.consecutive_failures, 0);
    }

    #[test]
    fn test_score_prefers_low_priority_number() {
        let metrics = EndpointMetrics::new();
        let high = endpoint_score(&endpoint(1), &metrics, 0.70);
        let low = endpoint_score(&endpoint(10), &metrics, 0.70);
        assert!(high > low);
    }

    #[test]
    fn test_score_penalizes_latency() {
        let fast = EndpointMetrics::new();
        let mut slow = EndpointMetrics::new();
        for _ in 0..50 {
            slow.record_success(Duration::from_millis(4_000));
        }
        let ep = endpoint(5);
        assert!(endpoint_score(&ep, &fast, 0.70) > endpoint_score(&ep, &slow, 0.70));
    }

    #[test]
    fn test_ws_dial_target() {
        let ep = NodeEndpoint {
            id: "wss://ws.example.com/path".into(),
            chain: Chain::Ethereum,
            transport: Transport::Ws,
            url: "wss://ws.example.com/path".into(),
            static_priority: 5,
            region: None,
            provider: None,
        };
        assert_eq!(
            HealthChecker::dial_target(&ep),
            Some("ws.example.com:443".to_string())
        );
    }
}
