//! # Batch request aggregator
//!
//! Coalesces "read the venue at these blocks" requests arriving within a short
//! debounce window into one JSON-RPC batch, then hands every caller the points
//! for the blocks it asked for.
//!
//! Each enqueue restarts the debounce timer, so a steady stream of requests
//! keeps delaying the flush. Requests coalesced into one flush must target the
//! same venue with the same quote amount; a mismatching request is rejected at
//! enqueue time.

pub mod transport;

use crate::contracts::i_curve_pool::ICURVEPOOL_ABI;
use crate::error::{Result, SdkError};
use crate::metrics;
use crate::task::CancelableTask;
use crate::types::conversions::u256_to_f64;
use ethers::abi::Token;
use ethers::types::{Address, Bytes, I256, U256};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

pub use transport::{BatchTransport, HttpBatchTransport, JsonRpcRequest, JsonRpcResponse};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(50);

/// Venue read at every block of a batch: `get_dy(i, j, quote_amount)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VenueParams {
    pub venue: Address,
    pub i: i128,
    pub j: i128,
    pub quote_amount: U256,
    pub input_decimals: u8,
    pub output_decimals: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub block: u64,
    /// Block timestamp in seconds, 0 when the header read failed.
    pub timestamp: u64,
    /// Raw venue output for the quote amount, 0 when the call failed.
    pub output: U256,
    /// Output per unit of input.
    pub price: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BatchRequestResult {
    pub points: Vec<DataPoint>,
    pub errors: Vec<String>,
}

struct Waiter {
    blocks: Vec<u64>,
    reply: oneshot::Sender<Result<BatchRequestResult>>,
}

#[derive(Default)]
struct Pending {
    params: Option<VenueParams>,
    waiters: Vec<Waiter>,
}

struct Inner {
    transport: Arc<dyn BatchTransport>,
    debounce: Duration,
    pending: Mutex<Pending>,
    timer: Mutex<CancelableTask>,
}

/// Cloning is cheap and clones share the pending queue.
#[derive(Clone)]
pub struct BatchAggregator {
    inner: Arc<Inner>,
}

impl BatchAggregator {
    pub fn new(transport: Arc<dyn BatchTransport>, debounce: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                debounce,
                pending: Mutex::new(Pending::default()),
                timer: Mutex::new(CancelableTask::new()),
            }),
        }
    }

    /// Queue a read of `params` at `blocks` and wait for the flush that covers it.
    pub async fn request(&self, blocks: &[u64], params: VenueParams) -> Result<BatchRequestResult> {
        if blocks.is_empty() {
            return Ok(BatchRequestResult::default());
        }
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending.lock().await;
            match pending.params {
                Some(queued) if queued != params => {
                    return Err(SdkError::PolicyViolation(format!(
                        "batch already queued for venue {:?} with quote amount {}; cannot mix with venue {:?} quote amount {}",
                        queued.venue, queued.quote_amount, params.venue, params.quote_amount
                    )));
                }
                _ => pending.params = Some(params),
            }
            pending.waiters.push(Waiter {
                blocks: blocks.to_vec(),
                reply: tx,
            });

            // Restart, not extend: the flush fires `debounce` after the last enqueue.
            let inner = Arc::clone(&self.inner);
            let mut timer = self.inner.timer.lock().await;
            timer.start(async move {
                tokio::time::sleep(inner.debounce).await;
                let drained = {
                    let mut pending = inner.pending.lock().await;
                    std::mem::take(&mut *pending)
                };
                // Run the round trip outside the timer so a later restart cannot abort it.
                tokio::spawn(execute(Arc::clone(&inner.transport), drained));
            });
        }

        rx.await
            .unwrap_or_else(|_| Err(SdkError::AggregationFailure("batch was dropped".to_string())))
    }

    /// Callers currently waiting for a flush.
    pub async fn pending_requests(&self) -> usize {
        self.inner.pending.lock().await.waiters.len()
    }
}

async fn execute(transport: Arc<dyn BatchTransport>, batch: Pending) {
    let Some(params) = batch.params else {
        return;
    };
    if batch.waiters.is_empty() {
        return;
    }

    let union: BTreeSet<u64> = batch
        .waiters
        .iter()
        .flat_map(|w| w.blocks.iter().copied())
        .collect();
    let blocks: Vec<u64> = union.into_iter().collect();
    debug!(
        callers = batch.waiters.len(),
        blocks = blocks.len(),
        "flushing batch"
    );

    let outcome = match build_requests(&blocks, &params) {
        Ok(requests) => transport.send_batch(requests).await,
        Err(e) => Err(e),
    };

    match outcome {
        Ok(responses) => {
            metrics::record_batch_flush("ok", blocks.len());
            let (points, errors) = collect_points(&blocks, &params, responses);
            for waiter in batch.waiters {
                let _ = waiter.reply.send(Ok(select(&waiter.blocks, &points, &errors)));
            }
        }
        Err(e) => {
            metrics::record_batch_flush("error", blocks.len());
            warn!(error = %e, blocks = blocks.len(), "batch request failed");
            let failure = SdkError::AggregationFailure(e.to_string());
            for waiter in batch.waiters {
                let _ = waiter.reply.send(Err(failure.clone()));
            }
        }
    }
}

/// Request ids: `2k` is the header of `blocks[k]`, `2k + 1` the venue call.
fn build_requests(blocks: &[u64], params: &VenueParams) -> Result<Vec<JsonRpcRequest>> {
    let get_dy = ICURVEPOOL_ABI
        .function("get_dy")
        .map_err(|e| SdkError::Decode(e.to_string()))?;
    let data = get_dy
        .encode_input(&[
            Token::Int(I256::from(params.i).into_raw()),
            Token::Int(I256::from(params.j).into_raw()),
            Token::Uint(params.quote_amount),
        ])
        .map_err(|e| SdkError::Decode(e.to_string()))?;
    let data = Bytes::from(data);

    let mut requests = Vec::with_capacity(blocks.len() * 2);
    for (k, block) in blocks.iter().enumerate() {
        let tag = format!("{:#x}", block);
        let id = (k as u64) * 2;
        requests.push(JsonRpcRequest::new(
            id,
            "eth_getBlockByNumber",
            json!([tag, false]),
        ));
        requests.push(JsonRpcRequest::new(
            id + 1,
            "eth_call",
            json!([{ "to": params.venue, "data": data }, tag]),
        ));
    }
    Ok(requests)
}

fn collect_points(
    blocks: &[u64],
    params: &VenueParams,
    responses: Vec<JsonRpcResponse>,
) -> (HashMap<u64, DataPoint>, BTreeMap<u64, Vec<String>>) {
    let mut by_id: HashMap<u64, JsonRpcResponse> =
        responses.into_iter().map(|r| (r.id, r)).collect();
    let mut points = HashMap::with_capacity(blocks.len());
    let mut errors: BTreeMap<u64, Vec<String>> = BTreeMap::new();

    for (k, &block) in blocks.iter().enumerate() {
        let id = (k as u64) * 2;
        let timestamp = match by_id.remove(&id).map(parse_timestamp) {
            Some(Ok(ts)) => ts,
            Some(Err(e)) => {
                errors.entry(block).or_default().push(format!("block {}: {}", block, e));
                0
            }
            None => {
                errors
                    .entry(block)
                    .or_default()
                    .push(format!("block {}: missing header response", block));
                0
            }
        };
        let output = match by_id.remove(&(id + 1)).map(parse_output) {
            Some(Ok(out)) => out,
            Some(Err(e)) => {
                errors.entry(block).or_default().push(format!("block {}: {}", block, e));
                U256::zero()
            }
            None => {
                errors
                    .entry(block)
                    .or_default()
                    .push(format!("block {}: missing call response", block));
                U256::zero()
            }
        };
        let quote = u256_to_f64(params.quote_amount, params.input_decimals);
        let price = if quote > 0.0 {
            u256_to_f64(output, params.output_decimals) / quote
        } else {
            0.0
        };
        points.insert(
            block,
            DataPoint {
                block,
                timestamp,
                output,
                price,
            },
        );
    }
    (points, errors)
}

fn response_result(response: JsonRpcResponse) -> std::result::Result<serde_json::Value, String> {
    if let Some(err) = response.error {
        return Err(err.message);
    }
    match response.result {
        Some(serde_json::Value::Null) | None => Err("empty result".to_string()),
        Some(value) => Ok(value),
    }
}

fn parse_timestamp(response: JsonRpcResponse) -> std::result::Result<u64, String> {
    let header = response_result(response)?;
    let raw = header
        .get("timestamp")
        .and_then(|t| t.as_str())
        .ok_or_else(|| "header has no timestamp".to_string())?;
    u64::from_str_radix(raw.trim_start_matches("0x"), 16).map_err(|e| e.to_string())
}

fn parse_output(response: JsonRpcResponse) -> std::result::Result<U256, String> {
    let value = response_result(response)?;
    let raw = value
        .as_str()
        .ok_or_else(|| "call result is not a hex string".to_string())?;
    let bytes = hex::decode(raw.trim_start_matches("0x")).map_err(|e| e.to_string())?;
    if bytes.len() < 32 {
        return Err(format!("call returned {} bytes", bytes.len()));
    }
    Ok(U256::from_big_endian(&bytes[..32]))
}

/// The caller's blocks, in request order without duplicates, plus their errors.
fn select(
    blocks: &[u64],
    points: &HashMap<u64, DataPoint>,
    errors: &BTreeMap<u64, Vec<String>>,
) -> BatchRequestResult {
    let mut seen = BTreeSet::new();
    let mut result = BatchRequestResult::default();
    for block in blocks {
        if !seen.insert(*block) {
            continue;
        }
        if let Some(point) = points.get(block) {
            result.points.push(point.clone());
        }
        if let Some(errs) = errors.get(block) {
            result.errors.extend(errs.iter().cloned());
        }
    }
    result
}
