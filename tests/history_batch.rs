//! Integration tests for price history through the context's batch aggregator
//!
//! Tests cover:
//! - History and ad-hoc venue reads coalescing into one JSON-RPC batch
//! - Head discovery via `eth_blockNumber`
//!
//! Note: the node is a scripted transport

use async_trait::async_trait;
use dollar_route_sdk::batch::{BatchTransport, JsonRpcRequest, JsonRpcResponse};
use dollar_route_sdk::chain::DataSource;
use dollar_route_sdk::clock::Clock;
use dollar_route_sdk::history::HistoryRange;
use dollar_route_sdk::route::RouteInputs;
use dollar_route_sdk::types::{
    AmmQuote, Direction, OraclePrices, ProtocolReadout, ProtocolState, TrackedToken, VenueReadout,
};
use dollar_route_sdk::{Result, SdkContext, SdkError, Settings};
use ethers::types::{Address, U256};
use indexmap::IndexMap;
use serde_json::json;
use std::sync::{Arc, Mutex};

/// Head at 1_000_000; every venue call returns 0.999 collateral per dollar.
#[derive(Default)]
struct ScriptedNode {
    batches: Mutex<Vec<Vec<JsonRpcRequest>>>,
}

impl ScriptedNode {
    fn call_batches(&self) -> Vec<Vec<JsonRpcRequest>> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .filter(|b| b.iter().any(|r| r.method == "eth_call"))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl BatchTransport for ScriptedNode {
    async fn send_batch(&self, requests: Vec<JsonRpcRequest>) -> Result<Vec<JsonRpcResponse>> {
        self.batches.lock().unwrap().push(requests.clone());
        Ok(requests
            .iter()
            .map(|req| match req.method.as_str() {
                "eth_blockNumber" => JsonRpcResponse::ok(req.id, json!("0xf4240")),
                "eth_getBlockByNumber" => {
                    JsonRpcResponse::ok(req.id, json!({ "timestamp": "0x6553f100" }))
                }
                _ => {
                    let mut word = [0u8; 32];
                    (U256::from(999u64) * U256::exp10(15)).to_big_endian(&mut word);
                    JsonRpcResponse::ok(req.id, json!(format!("0x{}", hex::encode(word))))
                }
            })
            .collect())
    }
}

/// The history path never touches the data source.
struct NoChain;

#[async_trait]
impl RouteInputs for NoChain {
    async fn protocol_state(&self) -> Result<ProtocolState> {
        Err(SdkError::TransientFetch("offline".to_string()))
    }
    async fn oracle_prices(&self) -> Result<OraclePrices> {
        Err(SdkError::TransientFetch("offline".to_string()))
    }
    async fn amm_quote(&self, _direction: Direction, _amount_in: U256) -> Result<AmmQuote> {
        Err(SdkError::TransientFetch("offline".to_string()))
    }
}

#[async_trait]
impl DataSource for NoChain {
    async fn protocol_readout(&self) -> Result<ProtocolReadout> {
        Err(SdkError::TransientFetch("offline".to_string()))
    }
    async fn balances(
        &self,
        _account: Address,
        _tokens: &[TrackedToken],
    ) -> Result<IndexMap<Address, U256>> {
        Err(SdkError::TransientFetch("offline".to_string()))
    }
    async fn venue_readout(&self) -> Result<VenueReadout> {
        Err(SdkError::TransientFetch("offline".to_string()))
    }
}

fn context(node: Arc<ScriptedNode>) -> SdkContext {
    let mut settings = Settings::default();
    settings.contracts.venue.address = Address::repeat_byte(0x77);
    SdkContext::assemble(
        settings,
        Arc::new(NoChain),
        node,
        None,
        Clock::starting_at(1_700_000_000_000),
    )
}

#[tokio::test(start_paused = true)]
async fn test_history_and_direct_reads_share_a_batch() {
    let node = Arc::new(ScriptedNode::default());
    let ctx = context(node.clone());
    let params = ctx.settings.history_params();

    let (history, direct) = tokio::join!(
        ctx.history.fetch_at(1_000_000, HistoryRange::Day, 5),
        ctx.aggregator.request(&[998_200, 1_000_000], params),
    );
    let history = history.unwrap();
    let direct = direct.unwrap();

    let batches = node.call_batches();
    assert_eq!(batches.len(), 1);
    // header + call for each of the five distinct blocks
    assert_eq!(batches[0].len(), 10);

    let blocks: Vec<u64> = history.points.iter().map(|p| p.block).collect();
    assert_eq!(blocks, vec![992_800, 994_600, 996_400, 998_200, 1_000_000]);
    assert_eq!(direct.points.len(), 2);
    assert!(history.points.iter().all(|p| (p.price - 0.999).abs() < 1e-12));
    assert!(history.points.iter().all(|p| p.timestamp == 1_700_000_000));
    assert!(history.errors.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_history_fetch_reads_head_first() {
    let node = Arc::new(ScriptedNode::default());
    let ctx = context(node.clone());

    let week = ctx.history.fetch(HistoryRange::Week).await.unwrap();
    assert_eq!(week.points.len(), HistoryRange::Week.default_points());
    assert_eq!(week.points.last().map(|p| p.block), Some(1_000_000));

    let batches = node.batches.lock().unwrap();
    assert_eq!(batches[0].len(), 1);
    assert_eq!(batches[0][0].method, "eth_blockNumber");
}
