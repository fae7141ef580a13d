pub mod bitcoin;
pub mod ethereum;
pub mod rpc;
pub mod solana;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::services::endpoint::{ConnectionManager, EndpointError};
use crate::services::event::Chain;
use crate::services::pipeline::Ingestor;

pub use bitcoin::BitcoinAdapter;
pub use ethereum::EthereumAdapter;
pub use rpc::JsonRpcClient;
pub use solana::SolanaAdapter;

/// Everything an adapter needs from the rest of the relay.
///
/// Adapters hold no endpoints of their own: they ask the manager for the
/// best one per request and learn about health transitions over the
/// broadcast channel.
#[derive(Clone)]
pub struct AdapterContext {
    pub manager: Arc<ConnectionManager>,
    pub ingestor: Ingestor,
    pub shutdown: broadcast::Sender<()>,
}

impl AdapterContext {
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }
}

/// One upstream listener per chain. `run` owns reconnection and failover and
/// returns only when the shutdown signal fires; the relay layer wraps it in
/// a task to provide start/stop semantics.
#[async_trait]
pub trait ChainAdapter: Send + Sync {
    fn chain(&self) -> Chain;

    fn name(&self) -> &'static str;

    async fn run(self: Arc<Self>, ctx: AdapterContext);
}

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error(transparent)]
    NoEndpoint(#[from] EndpointError),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("RPC error: {0}")]
    Rpc(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Handshake rejected: {0}")]
    Handshake(String),
    #[error("All endpoints failed")]
    AllEndpointsFailed,
}

impl AdapterError {
    /// Transient errors are retried and failed over; the rest mark the
    /// endpoint sick
    pub fn is_transient(&self) -> bool {
        matches!(self, AdapterError::Transport(_) | AdapterError::AllEndpointsFailed)
    }
}
