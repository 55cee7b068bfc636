//! Venue price history: sample blocks over a time window and read them
//! through the batch aggregator.

use crate::batch::{BatchAggregator, BatchRequestResult, BatchTransport, JsonRpcRequest, VenueParams};
use crate::error::{Result, SdkError};
use crate::utils::sample_blocks;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryRange {
    Day,
    Week,
    Month,
}

impl HistoryRange {
    pub fn window_secs(&self) -> u64 {
        match self {
            HistoryRange::Day => 86_400,
            HistoryRange::Week => 7 * 86_400,
            HistoryRange::Month => 30 * 86_400,
        }
    }

    pub fn default_points(&self) -> usize {
        match self {
            HistoryRange::Day => 24,
            HistoryRange::Week => 28,
            HistoryRange::Month => 30,
        }
    }
}

pub struct PriceHistory {
    aggregator: BatchAggregator,
    transport: Arc<dyn BatchTransport>,
    params: VenueParams,
    block_time_secs: u64,
}

impl PriceHistory {
    pub fn new(
        aggregator: BatchAggregator,
        transport: Arc<dyn BatchTransport>,
        params: VenueParams,
        block_time_secs: u64,
    ) -> Self {
        Self {
            aggregator,
            transport,
            params,
            block_time_secs,
        }
    }

    /// Price points across `range`, ending at the current head.
    pub async fn fetch(&self, range: HistoryRange) -> Result<BatchRequestResult> {
        let head = self.latest_block().await?;
        self.fetch_at(head, range, range.default_points()).await
    }

    pub async fn fetch_at(
        &self,
        head: u64,
        range: HistoryRange,
        points: usize,
    ) -> Result<BatchRequestResult> {
        let blocks = sample_blocks(head, range.window_secs(), self.block_time_secs, points);
        log::debug!(
            "history {:?}: {} blocks ending at {}",
            range,
            blocks.len(),
            head
        );
        self.aggregator.request(&blocks, self.params).await
    }

    async fn latest_block(&self) -> Result<u64> {
        let mut responses = self
            .transport
            .send_batch(vec![JsonRpcRequest::new(0, "eth_blockNumber", json!([]))])
            .await?;
        let response = responses
            .pop()
            .ok_or_else(|| SdkError::TransientFetch("empty eth_blockNumber response".to_string()))?;
        if let Some(err) = response.error {
            return Err(SdkError::classify(err.message));
        }
        let raw = response
            .result
            .as_ref()
            .and_then(|v| v.as_str())
            .ok_or_else(|| SdkError::Decode("eth_blockNumber result is not a string".to_string()))?;
        u64::from_str_radix(raw.trim_start_matches("0x"), 16)
            .map_err(|e| SdkError::Decode(format!("bad block number {}: {}", raw, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{JsonRpcResponse, DEFAULT_DEBOUNCE};
    use async_trait::async_trait;
    use ethers::types::{Address, U256};
    use std::sync::Mutex;

    #[derive(Default)]
    struct ChainStub {
        requested_blocks: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl BatchTransport for ChainStub {
        async fn send_batch(&self, requests: Vec<JsonRpcRequest>) -> Result<Vec<JsonRpcResponse>> {
            Ok(requests
                .into_iter()
                .map(|req| match req.method.as_str() {
                    "eth_blockNumber" => JsonRpcResponse::ok(req.id, json!("0xf4240")),
                    "eth_getBlockByNumber" => {
                        let tag = req.params[0].as_str().unwrap_or_default().to_string();
                        let block = u64::from_str_radix(tag.trim_start_matches("0x"), 16).unwrap();
                        self.requested_blocks.lock().unwrap().push(block);
                        JsonRpcResponse::ok(req.id, json!({ "timestamp": "0x64" }))
                    }
                    _ => JsonRpcResponse::ok(req.id, json!(format!("0x{}", "00".repeat(32)))),
                })
                .collect())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn day_history_samples_back_from_head() {
        let stub = Arc::new(ChainStub::default());
        let aggregator = BatchAggregator::new(stub.clone(), DEFAULT_DEBOUNCE);
        let params = VenueParams {
            venue: Address::repeat_byte(7),
            i: 1,
            j: 0,
            quote_amount: U256::exp10(18),
            input_decimals: 18,
            output_decimals: 18,
        };
        let history = PriceHistory::new(aggregator, stub.clone(), params, 12);

        let result = history.fetch(HistoryRange::Day).await.unwrap();
        assert_eq!(result.points.len(), 24);
        assert_eq!(result.points.last().unwrap().block, 1_000_000);
        assert!(result.points.windows(2).all(|w| w[0].block < w[1].block));
        assert_eq!(stub.requested_blocks.lock().unwrap().len(), 24);
    }
}
