use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::services::adapter::rpc::JsonRpcClient;
use crate::services::adapter::{AdapterContext, ChainAdapter};
use crate::services::event::{BlockEvent, BlockHash, Chain, Transport};

/// Floor on the poll interval; Solana's sub-second slot time would otherwise
/// hammer public RPC endpoints
const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Solana adapter: polls the best RPC endpoint for the latest blockhash.
/// Slot numbers serve as heights; the base58 blockhash is the identity.
pub struct SolanaAdapter {
    poll_interval: Duration,
}

impl SolanaAdapter {
    pub fn new() -> Self {
        Self {
            poll_interval: Chain::Solana.nominal_interblock().max(MIN_POLL_INTERVAL),
        }
    }

    async fn poll_once(&self, ctx: &AdapterContext, client: &JsonRpcClient) {
        let response = client
            .call::<Value>(
                Chain::Solana,
                "getLatestBlockhash",
                json!([{"commitment": "confirmed"}]),
            )
            .await;

        match response {
            Ok(value) => {
                let source = ctx
                    .manager
                    .get_best(Chain::Solana, Transport::Rpc)
                    .map(|ep| ep.id.clone())
                    .unwrap_or_else(|_| "rpc".to_string());
                if let Some(event) = block_event_from_response(&value, &source) {
                    ctx.ingestor.submit(event);
                }
            }
            Err(err) => {
                tracing::debug!(error = %err, "Solana poll failed");
            }
        }
    }
}

impl Default for SolanaAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChainAdapter for SolanaAdapter {
    fn chain(&self) -> Chain {
        Chain::Solana
    }

    fn name(&self) -> &'static str {
        "solana"
    }

    async fn run(self: Arc<Self>, ctx: AdapterContext) {
        let client = JsonRpcClient::new(ctx.manager.clone());
        let mut shutdown = ctx.shutdown_signal();
        let mut tick = tokio::time::interval(self.poll_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.poll_once(&ctx, &client).await;
                    ctx.ingestor.cooperative_backoff().await;
                }
                _ = shutdown.recv() => break,
            }
        }
        tracing::info!("Solana adapter stopped");
    }
}

/// `getLatestBlockhash` response shape:
/// `{"context":{"slot":N},"value":{"blockhash":"base58","lastValidBlockHeight":M}}`
fn block_event_from_response(value: &Value, source_id: &str) -> Option<BlockEvent> {
    let slot = value.get("context")?.get("slot")?.as_u64()?;
    let blockhash = value.get("value")?.get("blockhash")?.as_str()?;
    let bytes = bs58::decode(blockhash).into_vec().ok()?;

    // Announcements carry no block body; this is the header-only fast path
    Some(BlockEvent::new(Chain::Solana, BlockHash::new(bytes), slot, source_id).header_only())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_event_from_response() {
        // A real blockhash decodes to 32 bytes; encode one that does
        let encoded = bs58::encode(vec![7u8; 32]).into_string();
        let response = json!({
            "context": {"slot": 312_500_000u64},
            "value": {"blockhash": encoded, "lastValidBlockHeight": 290_000_000u64}
        });

        let event = block_event_from_response(&response, "https://sol").unwrap();
        assert_eq!(event.chain, Chain::Solana);
        assert_eq!(event.height, 312_500_000);
        assert_eq!(event.hash.len(), 32);
        assert!(event.is_header_only);
        assert!(event.validate().is_ok());
    }

    #[test]
    fn test_no_event_from_partial_response() {
        let response = json!({"context": {"slot": 1}});
        assert!(block_event_from_response(&response, "src").is_none());
    }
}
