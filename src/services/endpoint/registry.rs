use std::collections::HashMap;
use std::sync::Arc;

use crate::config::relay_config::RelayConfig;
use crate::services::event::{Chain, Transport};

/// One upstream transport instance for one chain.
///
/// Static identity only; runtime health lives in `EndpointMetrics`, owned by
/// the `ConnectionManager`. Endpoints are created at registry init and never
/// destroyed during process life.
#[derive(Debug, Clone)]
pub struct NodeEndpoint {
    /// Stable identifier; the URL is unique per registry
    pub id: String,
    pub chain: Chain,
    pub transport: Transport,
    pub url: String,
    /// 1 is the most preferred, 10 the least
    pub static_priority: u8,
    pub region: Option<String>,
    pub provider: Option<String>,
}

/// Static list of candidate upstreams per chain
#[derive(Debug)]
pub struct EndpointRegistry {
    endpoints: Vec<Arc<NodeEndpoint>>,
    by_chain: HashMap<Chain, Vec<Arc<NodeEndpoint>>>,
}

impl EndpointRegistry {
    pub fn from_config(config: &RelayConfig) -> Self {
        let mut endpoints = Vec::new();
        let mut by_chain: HashMap<Chain, Vec<Arc<NodeEndpoint>>> = HashMap::new();

        for chain in &config.chains {
            for ep in config.endpoints_for(*chain) {
                let endpoint = Arc::new(NodeEndpoint {
                    id: ep.url.clone(),
                    chain: *chain,
                    transport: ep.transport,
                    url: ep.url.clone(),
                    static_priority: ep.priority,
                    region: ep.region.clone(),
                    provider: ep.provider.clone(),
                });
                endpoints.push(endpoint.clone());
                by_chain.entry(*chain).or_default().push(endpoint);
            }
        }

        tracing::info!(
            endpoints = endpoints.len(),
            chains = by_chain.len(),
            "Endpoint registry initialized"
        );

        Self { endpoints, by_chain }
    }

    pub fn all(&self) -> &[Arc<NodeEndpoint>] {
        &self.endpoints
    }

    pub fn for_chain(&self, chain: Chain) -> &[Arc<NodeEndpoint>] {
        self.by_chain.get(&chain).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn for_chain_transport(&self, chain: Chain, transport: Transport) -> Vec<Arc<NodeEndpoint>> {
        self.for_chain(chain)
            .iter()
            .filter(|ep| ep.transport == transport)
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<Arc<NodeEndpoint>> {
        self.endpoints.iter().find(|ep| ep.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}
