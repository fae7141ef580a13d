use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use crate::services::event::{Chain, Transport};

/// Service tier: selects defaults for peer count, worker count, queue depth,
/// dedup capacity and cache size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Business,
    Enterprise,
    Turbo,
}

impl Default for Tier {
    fn default() -> Self {
        Tier::Business
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "free" => Ok(Tier::Free),
            "business" => Ok(Tier::Business),
            "enterprise" => Ok(Tier::Enterprise),
            "turbo" => Ok(Tier::Turbo),
            other => Err(format!("Unknown tier: {}", other)),
        }
    }
}

impl Tier {
    pub fn max_peers(&self) -> usize {
        match self {
            Tier::Free => 2,
            Tier::Business => 4,
            Tier::Enterprise => 8,
            Tier::Turbo => 20,
        }
    }

    pub fn worker_count(&self) -> usize {
        let cpus = num_cpus::get();
        match self {
            Tier::Free => (cpus / 2).max(1),
            Tier::Business | Tier::Enterprise => cpus,
            Tier::Turbo => cpus * 2,
        }
    }

    pub fn queue_depth(&self, workers: usize) -> usize {
        match self {
            Tier::Free => workers * 100,
            _ => workers * 200,
        }
    }

    pub fn dedup_max_size(&self) -> usize {
        match self {
            Tier::Free => 2_500,
            Tier::Business => 5_000,
            Tier::Enterprise => 10_000,
            Tier::Turbo => 20_000,
        }
    }

    pub fn cache_max_entries(&self) -> usize {
        match self {
            Tier::Free => 2_000,
            Tier::Business => 10_000,
            Tier::Enterprise => 50_000,
            Tier::Turbo => 100_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub url: String,
    pub transport: Transport,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
}

fn default_priority() -> u8 {
    5
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceMode {
    Standard,
    HighPerformance,
    MemoryOptimized,
    LatencyOptimized,
}

impl Default for PerformanceMode {
    fn default() -> Self {
        PerformanceMode::Standard
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    #[serde(default = "default_base_ttl_seconds")]
    pub base_ttl_seconds: u64,
    /// Record cap; the tier default applies when absent
    #[serde(default)]
    pub max_size: Option<usize>,
    #[serde(default)]
    pub performance_mode: PerformanceMode,
}

fn default_base_ttl_seconds() -> u64 {
    300
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            base_ttl_seconds: default_base_ttl_seconds(),
            max_size: None,
            performance_mode: PerformanceMode::Standard,
        }
    }
}

impl DedupConfig {
    pub fn base_ttl(&self) -> Duration {
        Duration::from_secs(self.base_ttl_seconds)
    }

    pub fn max_size_or_default(&self) -> usize {
        self.max_size.unwrap_or(10_000)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_check_interval_seconds")]
    pub check_interval_seconds: u64,
    #[serde(default = "default_max_failures_before_down")]
    pub max_failures_before_down: u32,
    #[serde(default = "default_probe_timeout_seconds")]
    pub probe_timeout_seconds: u64,
    /// Sticky selection window for `get_best`
    #[serde(default = "default_sticky_window_seconds")]
    pub sticky_window_seconds: u64,
    /// Weight on latency in the endpoint score
    #[serde(default = "default_latency_weight")]
    pub latency_weight: f64,
}

fn default_check_interval_seconds() -> u64 {
    15
}

fn default_max_failures_before_down() -> u32 {
    3
}

fn default_probe_timeout_seconds() -> u64 {
    5
}

fn default_sticky_window_seconds() -> u64 {
    30
}

fn default_latency_weight() -> f64 {
    0.70
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_seconds: default_check_interval_seconds(),
            max_failures_before_down: default_max_failures_before_down(),
            probe_timeout_seconds: default_probe_timeout_seconds(),
            sticky_window_seconds: default_sticky_window_seconds(),
            latency_weight: default_latency_weight(),
        }
    }
}

impl HealthConfig {
    /// Probe interval, clamped to the 3 s floor
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_seconds.max(3))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_seconds)
    }

    pub fn sticky_window(&self) -> Duration {
        Duration::from_secs(self.sticky_window_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_open_duration_seconds")]
    pub open_duration_seconds: u64,
    #[serde(default = "default_half_open_probe_limit")]
    pub half_open_probe_limit: u32,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_open_duration_seconds() -> u64 {
    60
}

fn default_half_open_probe_limit() -> u32 {
    3
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            open_duration_seconds: default_open_duration_seconds(),
            half_open_probe_limit: default_half_open_probe_limit(),
        }
    }
}

impl CircuitConfig {
    pub fn breaker_config(&self) -> crate::services::resilience::CircuitBreakerConfig {
        crate::services::resilience::CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            open_duration: Duration::from_secs(self.open_duration_seconds),
            half_open_probe_limit: self.half_open_probe_limit,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_max_bytes")]
    pub max_bytes: u64,
    #[serde(default)]
    pub max_entries: Option<usize>,
    #[serde(default = "default_cache_ttl_seconds")]
    pub default_ttl_seconds: u64,
}

fn default_cache_max_bytes() -> u64 {
    256 * 1024 * 1024
}

fn default_cache_ttl_seconds() -> u64 {
    300
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_cache_max_bytes(),
            max_entries: None,
            default_ttl_seconds: default_cache_ttl_seconds(),
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PipelineConfig {
    /// Overrides the tier worker count when set
    #[serde(default)]
    pub workers: Option<usize>,
    /// Overrides the tier queue depth when set
    #[serde(default)]
    pub max_queue_depth: Option<usize>,
    #[serde(default = "default_shutdown_grace_seconds")]
    pub shutdown_grace_seconds: u64,
}

fn default_shutdown_grace_seconds() -> u64 {
    30
}

impl PipelineConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }
}

/// Top-level relay configuration, loaded from JSON with `${VAR}` substitution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub chains: Vec<Chain>,
    pub endpoints: HashMap<Chain, Vec<EndpointConfig>>,
    #[serde(default)]
    pub tier: Tier,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub circuit: CircuitConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

impl RelayConfig {
    /// Load configuration from a JSON file with environment variable substitution
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        let content = substitute_env_vars(&content);
        let config: RelayConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn worker_count(&self) -> usize {
        self.pipeline.workers.unwrap_or_else(|| self.tier.worker_count())
    }

    pub fn max_queue_depth(&self) -> usize {
        self.pipeline
            .max_queue_depth
            .unwrap_or_else(|| self.tier.queue_depth(self.worker_count()))
    }

    pub fn endpoints_for(&self, chain: Chain) -> &[EndpointConfig] {
        self.endpoints.get(&chain).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Fatal-config checks: the process does not start when these fail
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chains.is_empty() {
            return Err(ConfigError::Invalid("No chains configured".into()));
        }
        for chain in &self.chains {
            let endpoints = self.endpoints_for(*chain);
            if endpoints.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "Chain {} has no endpoints",
                    chain
                )));
            }
            for ep in endpoints {
                if !(1..=10).contains(&ep.priority) {
                    return Err(ConfigError::Invalid(format!(
                        "Endpoint {} priority {} outside 1..=10",
                        ep.url, ep.priority
                    )));
                }
                let scheme_ok = match ep.transport {
                    Transport::Rpc => ep.url.starts_with("http://") || ep.url.starts_with("https://"),
                    Transport::Ws => ep.url.starts_with("ws://") || ep.url.starts_with("wss://"),
                    // P2P endpoints are host:port pairs
                    Transport::P2p => !ep.url.contains("://"),
                };
                if !scheme_ok {
                    return Err(ConfigError::Invalid(format!(
                        "Endpoint {} scheme does not match transport {}",
                        ep.url, ep.transport
                    )));
                }
            }
        }
        if !(0.0..=1.0).contains(&self.health.latency_weight) {
            return Err(ConfigError::Invalid(
                "health.latency_weight must be within [0, 1]".into(),
            ));
        }
        Ok(())
    }
}

/// Expand `${NAME}` placeholders from the environment so API keys can stay
/// out of the config file. Unset variables leave the placeholder untouched.
fn substitute_env_vars(content: &str) -> String {
    let placeholder =
        regex::Regex::new(r"\$\{(?P<name>[A-Z_][A-Z0-9_]*)\}").expect("static pattern compiles");

    placeholder
        .replace_all(content, |caps: &regex::Captures<'_>| {
            let name = &caps["name"];
            std::env::var(name).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config(url: &str, transport: Transport) -> RelayConfig {
        let mut endpoints = HashMap::new();
        endpoints.insert(
            Chain::Ethereum,
            vec![EndpointConfig {
                url: url.to_string(),
                transport,
                priority: 5,
                region: None,
                provider: None,
            }],
        );
        RelayConfig {
            chains: vec![Chain::Ethereum],
            endpoints,
            tier: Tier::Business,
            dedup: DedupConfig::default(),
            health: HealthConfig::default(),
            circuit: CircuitConfig::default(),
            cache: CacheConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }

    #[test]
    fn test_validate_accepts_matching_scheme() {
        assert!(minimal_config("https://rpc.example.com", Transport::Rpc)
            .validate()
            .is_ok());
        assert!(minimal_config("wss://ws.example.com", Transport::Ws)
            .validate()
            .is_ok());
        assert!(minimal_config("seed.example.com:8333", Transport::P2p)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_validate_rejects_scheme_mismatch() {
        assert!(minimal_config("wss://ws.example.com", Transport::Rpc)
            .validate()
            .is_err());
    }

    #[test]
    fn test_validate_rejects_missing_endpoints() {
        let mut config = minimal_config("https://rpc.example.com", Transport::Rpc);
        config.chains.push(Chain::Bitcoin);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_health_interval_floor() {
        let health = HealthConfig {
            check_interval_seconds: 1,
            ..HealthConfig::default()
        };
        assert_eq!(health.check_interval(), Duration::from_secs(3));
    }

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("RELAY_TEST_VAR", "substituted");
        let input = r#"{"url": "${RELAY_TEST_VAR}"}"#;
        let output = substitute_env_vars(input);
        assert_eq!(output, r#"{"url": "substituted"}"#);
    }

    #[test]
    fn test_unset_placeholder_left_intact() {
        std::env::remove_var("RELAY_UNSET_VAR");
        let input = r#"{"url": "${RELAY_UNSET_VAR}/path"}"#;
        assert_eq!(substitute_env_vars(input), input);
    }

    #[test]
    fn test_tier_defaults_scale() {
        assert!(Tier::Turbo.max_peers() > Tier::Enterprise.max_peers());
        assert!(Tier::Turbo.dedup_max_size() > Tier::Free.dedup_max_size());
        assert!(Tier::Free.worker_count() >= 1);
    }

    #[test]
    fn test_parse_full_config() {
        let json = r#"{
            "chains": ["bitcoin", "ethereum"],
            "tier": "turbo",
            "endpoints": {
                "bitcoin": [{"url": "seed.bitcoin.example.com:8333", "transport": "p2p", "priority": 1}],
                "ethereum": [
                    {"url": "wss://eth.example.com/ws", "transport": "ws", "priority": 2, "provider": "example"},
                    {"url": "https://eth.example.com", "transport": "rpc"}
                ]
            },
            "dedup": {"base_ttl_seconds": 120, "performance_mode": "latency_optimized"},
            "circuit": {"failure_threshold": 3}
        }"#;
        let config: RelayConfig = serde_json::from_str(json).unwrap();
        config.validate().unwrap();
        assert_eq!(config.tier, Tier::Turbo);
        assert_eq!(config.dedup.base_ttl_seconds, 120);
        assert_eq!(config.dedup.performance_mode, PerformanceMode::LatencyOptimized);
        assert_eq!(config.circuit.failure_threshold, 3);
        assert_eq!(config.endpoints_for(Chain::Ethereum).len(), 2);
        // Unset fields fall back to serde defaults
        assert_eq!(config.dedup.max_size_or_default(), 10_000);
        assert_eq!(config.health.check_interval_seconds, 15);
    }
}
