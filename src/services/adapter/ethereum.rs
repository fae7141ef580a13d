use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_tungstenite::tungstenite::Message;

use crate::services::adapter::rpc::{parse_hex_u64, JsonRpcClient};
use crate::services::adapter::{AdapterContext, AdapterError, ChainAdapter};
use crate::services::endpoint::NodeEndpoint;
use crate::services::event::{BlockEvent, BlockHash, Chain, Transport};
use crate::services::resilience::RetryPolicy;

const WS_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Ethereum adapter: WebSocket `newHeads` subscription on the best WS
/// endpoint, falling back to RPC polling at the chain's natural cadence when
/// no WS endpoint is healthy.
pub struct EthereumAdapter {
    poll_interval: Duration,
    reconnect: RetryPolicy,
}

impl EthereumAdapter {
    pub fn new() -> Self {
        Self {
            poll_interval: Chain::Ethereum.nominal_interblock(),
            reconnect: RetryPolicy::transport(),
        }
    }

    async fn run_ws(&self, ctx: &AdapterContext, endpoint: Arc<NodeEndpoint>) -> Result<(), AdapterError> {
        let started = Instant::now();
        let connect = tokio::time::timeout(
            WS_CONNECT_TIMEOUT,
            tokio_tungstenite::connect_async(&endpoint.url),
        )
        .await;

        let (mut stream, _) = match connect {
            Ok(Ok(pair)) => {
                ctx.manager.report_result(&endpoint.id, started.elapsed(), true);
                pair
            }
            Ok(Err(err)) => {
                ctx.manager.report_result(&endpoint.id, started.elapsed(), false);
                return Err(AdapterError::Transport(err.to_string()));
            }
            Err(_) => {
                ctx.manager.report_result(&endpoint.id, started.elapsed(), false);
                return Err(AdapterError::Transport("WS connect timeout".into()));
            }
        };

        let subscribe = json!({
            "jsonrpc": "2.0",
            "method": "eth_subscribe",
            "params": ["newHeads"],
            "id": 1
        });
        stream
            .send(Message::text(subscribe.to_string()))
            .await
            .map_err(|e| AdapterError::Transport(e.to_string()))?;

        tracing::info!(endpoint = %endpoint.id, "Subscribed to newHeads");

        let mut shutdown = ctx.shutdown_signal();
        let mut transitions = ctx.manager.transitions();

        loop {
            tokio::select! {
                message = stream.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(event) = parse_new_head(&text, &endpoint.id) {
                                ctx.ingestor.submit(event);
                                ctx.ingestor.cooperative_backoff().await;
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = stream.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            ctx.manager.report_result(&endpoint.id, Duration::ZERO, false);
                            return Err(AdapterError::Transport(err.to_string()));
                        }
                        None => {
                            ctx.manager.report_result(&endpoint.id, Duration::ZERO, false);
                            return Err(AdapterError::Transport("WS stream closed".into()));
                        }
                    }
                }
                transition = transitions.recv() => {
                    // Persistent connections drop the moment their endpoint
                    // turns unhealthy
                    if let Ok(t) = transition {
                        if t.endpoint_id == endpoint.id && !t.is_healthy {
                            tracing::warn!(endpoint = %endpoint.id, "WS endpoint unhealthy; reconnecting");
                            return Err(AdapterError::Transport("endpoint marked unhealthy".into()));
                        }
                    }
                }
                _ = shutdown.recv() => return Ok(()),
            }
        }
    }

    /// One polling cycle against the best RPC endpoint
    async fn poll_once(&self, ctx: &AdapterContext, client: &JsonRpcClient) {
        match client
            .call::<Value>(Chain::Ethereum, "eth_getBlockByNumber", json!(["latest", false]))
            .await
        {
            Ok(block) => {
                let source = ctx
                    .manager
                    .get_best(Chain::Ethereum, Transport::Rpc)
                    .map(|ep| ep.id.clone())
                    .unwrap_or_else(|_| "rpc".to_string());
                if let Some(event) = block_event_from_header(&block, &source) {
                    ctx.ingestor.submit(event);
                }
            }
            Err(err) => {
                tracing::debug!(error = %err, "Ethereum poll failed");
            }
        }
    }
}

impl Default for EthereumAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChainAdapter for EthereumAdapter {
    fn chain(&self) -> Chain {
        Chain::Ethereum
    }

    fn name(&self) -> &'static str {
        "ethereum"
    }

    async fn run(self: Arc<Self>, ctx: AdapterContext) {
        let client = JsonRpcClient::new(ctx.manager.clone());
        let mut shutdown = ctx.shutdown_signal();
        let mut ws_failures: u32 = 0;

        loop {
            if shutdown.try_recv().is_ok() {
                break;
            }

            match ctx.manager.get_best(Chain::Ethereum, Transport::Ws) {
                Ok(endpoint) => match self.run_ws(&ctx, endpoint).await {
                    Ok(()) => break, // clean shutdown
                    Err(err) => {
                        ws_failures = ws_failures.saturating_add(1);
                        let delay = self.reconnect.delay_for(ws_failures.min(6));
                        tracing::warn!(error = %err, delay_ms = delay.as_millis() as u64, "WS session ended; backing off");
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = shutdown.recv() => break,
                        }
                    }
                },
                Err(_) => {
                    // No healthy WS endpoint: poll RPC at the natural cadence
                    self.poll_once(&ctx, &client).await;
                    ctx.ingestor.cooperative_backoff().await;
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = shutdown.recv() => break,
                    }
                }
            }
        }
        tracing::info!("Ethereum adapter stopped");
    }
}

/// Parse a `newHeads` subscription notification into a block event
fn parse_new_head(text: &str, source_id: &str) -> Option<BlockEvent> {
    let value: Value = serde_json::from_str(text).ok()?;
    if value.get("method")?.as_str()? != "eth_subscription" {
        return None;
    }
    let header = value.get("params")?.get("result")?;
    block_event_from_header(header, source_id)
}

/// Build a BlockEvent from an Ethereum header object. No event is
/// synthesized when identity fields are missing.
fn block_event_from_header(header: &Value, source_id: &str) -> Option<BlockEvent> {
    let hash = BlockHash::from_hex(header.get("hash")?.as_str()?).ok()?;
    let height = parse_hex_u64(header.get("number")?)?;
    let timestamp_secs = header.get("timestamp").and_then(parse_hex_u64);

    let mut event = BlockEvent::new(Chain::Ethereum, hash, height, source_id);
    if let Some(secs) = timestamp_secs {
        if let Some(ts) = DateTime::<Utc>::from_timestamp(secs as i64, 0) {
            event = event.with_timestamp(ts);
        }
    }
    if let Some(size) = header.get("size").and_then(parse_hex_u64) {
        event = event.with_size(size);
    }
    Some(event)
}
