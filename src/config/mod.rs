pub mod environment;
pub mod relay_config;

pub use relay_config::{
    CacheConfig, CircuitConfig, ConfigError, DedupConfig, EndpointConfig, HealthConfig,
    PerformanceMode, PipelineConfig, RelayConfig, Tier,
};
