// src/batch/transport.rs

//! Hand-built JSON-RPC batches: an array of independent requests in one POST.

use crate::error::{Result, SdkError};
use async_trait::async_trait;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use log::debug;
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

type DefaultDirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    pub params: serde_json::Value,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: &str, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub id: u64,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn ok(id: u64, result: serde_json::Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: u64, code: i64, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

/// One physical round trip carrying many JSON-RPC requests.
#[async_trait]
pub trait BatchTransport: Send + Sync {
    /// Send every request in one call. An `Err` means the whole call failed;
    /// per-request failures come back as responses with `error` set.
    async fn send_batch(&self, requests: Vec<JsonRpcRequest>) -> Result<Vec<JsonRpcResponse>>;
}

/// `BatchTransport` over HTTP, rate limited per process.
pub struct HttpBatchTransport {
    client: reqwest::Client,
    url: Url,
    limiter: Arc<DefaultDirectRateLimiter>,
}

impl HttpBatchTransport {
    pub fn new(url: Url, timeout: Duration, max_requests_per_second: u32) -> Result<Self> {
        let quota = Quota::per_second(NonZeroU32::new(max_requests_per_second).ok_or_else(
            || SdkError::Config("max_requests_per_second must be non-zero".to_string()),
        )?);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SdkError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url,
            limiter: Arc::new(RateLimiter::direct(quota)),
        })
    }
}

#[async_trait]
impl BatchTransport for HttpBatchTransport {
    async fn send_batch(&self, requests: Vec<JsonRpcRequest>) -> Result<Vec<JsonRpcResponse>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        self.limiter.until_ready().await;
        debug!("POST {} with {} batched requests", self.url, requests.len());

        let response = self
            .client
            .post(self.url.clone())
            .json(&requests)
            .send()
            .await
            .map_err(|e| SdkError::TransientFetch(format!("batch POST failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SdkError::TransientFetch(format!(
                "batch POST returned HTTP {}",
                status
            )));
        }

        // Some nodes answer a rejected batch with a single error object.
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| SdkError::Decode(format!("batch response is not JSON: {}", e)))?;
        match body {
            serde_json::Value::Array(_) => Ok(serde_json::from_value(body)?),
            other => {
                let single: JsonRpcResponse = serde_json::from_value(other)?;
                let message = single
                    .error
                    .map(|e| e.message)
                    .unwrap_or_else(|| "non-array batch response".to_string());
                Err(SdkError::TransientFetch(message))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_serializes_as_json_rpc() {
        let req = JsonRpcRequest::new(7, "eth_blockNumber", json!([]));
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(
            value,
            json!({"jsonrpc": "2.0", "id": 7, "method": "eth_blockNumber", "params": []})
        );
    }

    #[test]
    fn response_parses_result_or_error() {
        let batch: Vec<JsonRpcResponse> = serde_json::from_value(json!([
            {"jsonrpc": "2.0", "id": 1, "result": "0x10"},
            {"jsonrpc": "2.0", "id": 2, "error": {"code": -32000, "message": "header not found"}}
        ]))
        .unwrap();
        assert_eq!(batch[0], JsonRpcResponse::ok(1, json!("0x10")));
        assert_eq!(batch[1], JsonRpcResponse::err(2, -32000, "header not found"));
    }

    #[test]
    fn zero_rate_is_a_config_error() {
        let url = Url::parse("http://localhost:8545").unwrap();
        let err = HttpBatchTransport::new(url, Duration::from_secs(1), 0)
            .err()
            .unwrap();
        assert!(matches!(err, SdkError::Config(_)));
    }
}
