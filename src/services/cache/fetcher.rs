use serde_json::{json, Value};
use std::sync::Arc;

use crate::services::adapter::JsonRpcClient;
use crate::services::cache::{BlockCache, CacheError};
use crate::services::endpoint::ConnectionManager;
use crate::services::event::{BlockHash, Chain};

/// Read-through block access for downstream consumers.
///
/// Hits are served from the cache; misses trigger a single-flighted fill
/// routed through the connection manager's best endpoint, so a thundering
/// herd of readers costs one upstream call.
pub struct BlockFetcher {
    cache: Arc<BlockCache>,
    client: JsonRpcClient,
}

impl BlockFetcher {
    pub fn new(cache: Arc<BlockCache>, manager: Arc<ConnectionManager>) -> Self {
        Self {
            cache,
            client: JsonRpcClient::new(manager),
        }
    }

    pub async fn block_by_hash(&self, chain: Chain, hash: &BlockHash) -> Result<Arc<Value>, CacheError> {
        let key = BlockCache::hash_key(chain, hash);
        let client = &self.client;
        let hash = hash.clone();
        self.cache
            .get_or_fill(&key, move || async move {
                fetch_by_hash(client, chain, &hash).await
            })
            .await
    }

    pub async fn block_by_height(&self, chain: Chain, height: u64) -> Result<Arc<Value>, CacheError> {
        let key = BlockCache::height_key(chain, height);
        let client = &self.client;
        self.cache
            .get_or_fill(&key, move || async move {
                fetch_by_height(client, chain, height).await
            })
            .await
    }
}

async fn fetch_by_hash(
    client: &JsonRpcClient,
    chain: Chain,
    hash: &BlockHash,
) -> Result<Value, String> {
    match chain {
        Chain::Ethereum => client
            .call(
                chain,
                "eth_getBlockByHash",
                json!([format!("0x{}", hash), false]),
            )
            .await
            .map_err(|e| e.to_string()),
        Chain::Bitcoin => client
            .call(chain, "getblock", json!([btc_rpc_hash(hash), 1]))
            .await
            .map_err(|e| e.to_string()),
        // Solana blocks are addressed by slot, not by blockhash
        Chain::Solana => Err("solana blocks are fetched by slot".to_string()),
    }
}

async fn fetch_by_height(
    client: &JsonRpcClient,
    chain: Chain,
    height: u64,
) -> Result<Value, String> {
    match chain {
        Chain::Ethereum => client
            .call(
                chain,
                "eth_getBlockByNumber",
                json!([format!("0x{:x}", height), false]),
            )
            .await
            .map_err(|e| e.to_string()),
        Chain::Bitcoin => {
            let hash: String = client
                .call(chain, "getblockhash", json!([height]))
                .await
                .map_err(|e| e.to_string())?;
            client
                .call(chain, "getblock", json!([hash, 1]))
                .await
                .map_err(|e| e.to_string())
        }
        Chain::Solana => client
            .call(
                chain,
                "getBlock",
                json!([height, {"transactionDetails": "none", "rewards": false}]),
            )
            .await
            .map_err(|e| e.to_string()),
    }
}

/// Bitcoin RPC addresses blocks by display-order hex, which is the wire
/// hash byte-reversed
fn btc_rpc_hash(hash: &BlockHash) -> String {
    let mut bytes = hash.as_bytes().to_vec();
    bytes.reverse();
    hex::encode(bytes)
}
