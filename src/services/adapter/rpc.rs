use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::services::adapter::AdapterError;
use crate::services::endpoint::ConnectionManager;
use crate::services::event::{Chain, Transport};
use crate::services::resilience::RetryPolicy;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorObj>,
    #[serde(default)]
    id: Value,
}

#[derive(Deserialize)]
struct RpcErrorObj {
    message: String,
}

/// JSON-RPC 2.0 client that routes every call through the best healthy
/// endpoint and reports outcomes back to the manager.
pub struct JsonRpcClient {
    client: reqwest::Client,
    manager: Arc<ConnectionManager>,
    retry: RetryPolicy,
}

impl JsonRpcClient {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            manager,
            retry: RetryPolicy::transport(),
        }
    }

    /// Single call with retry-with-backoff and failover across endpoints
    pub async fn call<T: DeserializeOwned>(
        &self,
        chain: Chain,
        method: &str,
        params: Value,
    ) -> Result<T, AdapterError> {
        let mut last_error = None;

        for attempt in 0..self.retry.max_attempts {
            let endpoint = self.manager.get_best(chain, Transport::Rpc)?;

            let started = Instant::now();
            let result = self
                .execute::<T>(&endpoint.url, method, params.clone())
                .await;
            let latency = started.elapsed();

            match result {
                Ok(value) => {
                    self.manager.report_result(&endpoint.id, latency, true);
                    return Ok(value);
                }
                Err(err) => {
                    self.manager.report_result(&endpoint.id, latency, false);
                    tracing::debug!(
                        chain = %chain,
                        endpoint = %endpoint.id,
                        method,
                        attempt,
                        error = %err,
                        "RPC call failed"
                    );
                    last_error = Some(err);
                    if self.retry.should_retry(attempt + 1) {
                        tokio::time::sleep(self.retry.delay_for(attempt)).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or(AdapterError::AllEndpointsFailed))
    }

    /// Batch call: distinct ids, responses mapped back to request order
    pub async fn batch(
        &self,
        chain: Chain,
        requests: &[(&str, Value)],
    ) -> Result<Vec<Value>, AdapterError> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        let endpoint = self.manager.get_best(chain, Transport::Rpc)?;

        let body: Vec<Value> = requests
            .iter()
            .enumerate()
            .map(|(id, (method, params))| {
                json!({
                    "jsonrpc": "2.0",
                    "method": method,
                    "params": params,
                    "id": id
                })
            })
            .collect();

        let started = Instant::now();
        let outcome = async {
            let response = self
                .client
                .post(&endpoint.url)
                .json(&body)
                .send()
                .await
                .map_err(|e| AdapterError::Transport(e.to_string()))?;
            if !response.status().is_success() {
                return Err(AdapterError::Transport(format!(
                    "HTTP {}",
                    response.status()
                )));
            }
            response
                .json::<Vec<RpcResponse<Value>>>()
                .await
                .map_err(|e| AdapterError::Parse(e.to_string()))
        }
        .await;
        let latency = started.elapsed();

        match outcome {
            Ok(responses) => {
                self.manager.report_result(&endpoint.id, latency, true);
                // Servers may reorder batch responses; ids restore the mapping
                let mut by_id: HashMap<u64, RpcResponse<Value>> = responses
                    .into_iter()
                    .filter_map(|r| r.id.as_u64().map(|id| (id, r)))
                    .collect();
                let mut results = Vec::with_capacity(requests.len());
                for id in 0..requests.len() as u64 {
                    match by_id.remove(&id) {
                        Some(RpcResponse {
                            result: Some(value),
                            error: None,
                            ..
                        }) => results.push(value),
                        Some(RpcResponse {
                            error: Some(err), ..
                        }) => return Err(AdapterError::Rpc(err.message)),
                        _ => {
                            return Err(AdapterError::Parse(format!(
                                "Missing batch response for id {}",
                                id
                            )))
                        }
                    }
                }
                Ok(results)
            }
            Err(err) => {
                self.manager.report_result(&endpoint.id, latency, false);
                Err(err)
            }
        }
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        url: &str,
        method: &str,
        params: Value,
    ) -> Result<T, AdapterError> {
        let payload = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        });

        let response = self
            .client
            .post(url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| AdapterError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AdapterError::Transport(format!("HTTP {}", response.status())));
        }

        let rpc_response: RpcResponse<T> = response
            .json()
            .await
            .map_err(|e| AdapterError::Parse(e.to_string()))?;

        if let Some(err) = rpc_response.error {
            return Err(AdapterError::Rpc(err.message));
        }

        rpc_response
            .result
            .ok_or_else(|| AdapterError::Parse("RPC result field absent".to_string()))
    }
}

/// Parse an 0x-prefixed hex quantity
pub fn parse_hex_u64(value: &Value) -> Option<u64> {
    value
        .as_str()
        .and_then(|s| u64::from_str_radix(s.trim_start_matches("0x"), 16).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_u64() {
        assert_eq!(parse_hex_u64(&json!("0x64")), Some(100));
        assert_eq!(parse_hex_u64(&json!("0x0")), Some(0));
        assert_eq!(parse_hex_u64(&json!(100)), None);
        assert_eq!(parse_hex_u64(&json!("bogus")), None);
    }
}
