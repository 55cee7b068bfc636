use crate::metrics;
pub use anyhow::Result;
use ethers::abi::{Function, Param, ParamType, StateMutability, Token};
use ethers::prelude::*;
use log::debug;
use std::sync::Arc;
use std::time::Duration;

/// Canonical Multicall3 deployment, same address on every EVM chain.
pub const MULTICALL3_ADDRESS: &str = "0xcA11bde05977b3631167028862bE2a173976CA11";

/// `Error(string)` selector used by `require`/`revert` reasons.
const ERROR_STRING_SELECTOR: [u8; 4] = [0x08, 0xc3, 0x79, 0xa0];

/// A single call to be batched in a multicall.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Call {
    pub target: Address,
    pub call_data: Bytes,
}

impl Call {
    /// Encode `function(args)` against `target`.
    pub fn encode(target: Address, function: &Function, args: &[Token]) -> Result<Self> {
        let call_data = function.encode_input(args)?;
        Ok(Self {
            target,
            call_data: Bytes::from(call_data),
        })
    }
}

/// Result of one sub-call inside an `aggregate3` batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallOutcome {
    pub success: bool,
    pub return_data: Bytes,
}

impl CallOutcome {
    /// Decode the return data with `function`'s outputs. A reverted sub-call
    /// becomes an error carrying the revert reason, so oracle failures such as
    /// "Stale data" keep their message.
    pub fn decode(&self, function: &Function) -> Result<Vec<Token>> {
        if !self.success {
            let reason = decode_revert_reason(&self.return_data)
                .unwrap_or_else(|| format!("0x{}", hex::encode(&self.return_data)));
            anyhow::bail!("{} reverted: {}", function.name, reason);
        }
        Ok(function.decode_output(&self.return_data)?)
    }
}

/// Extract the string from `Error(string)` revert data.
pub fn decode_revert_reason(data: &[u8]) -> Option<String> {
    if data.len() < 4 || data[..4] != ERROR_STRING_SELECTOR {
        return None;
    }
    ethers::abi::decode(&[ParamType::String], &data[4..])
        .ok()?
        .into_iter()
        .next()?
        .into_string()
}

/// Multicall3 `aggregate3` executor.
///
/// Identical calls are coalesced and results are returned in the caller's
/// order. Every sub-call is sent with `allowFailure = true`; use
/// [`CallOutcome::decode`] to surface per-call reverts.
#[derive(Clone)]
pub struct Multicall<M: Middleware> {
    pub provider: Arc<M>,
    multicall_address: Address,
    batch_size: usize,
    timeout: Duration,
}

impl<M: Middleware + 'static> Multicall<M> {
    pub fn new(provider: Arc<M>, multicall_address: Address, batch_size: usize) -> Self {
        if batch_size > 200 {
            log::warn!(
                "Multicall batch size {} exceeds recommended maximum (200), capping to 200",
                batch_size
            );
        }

        Self {
            provider,
            multicall_address,
            batch_size: batch_size.clamp(1, 200),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Runs a batch of calls, optionally at a specific block.
    pub async fn run(&self, calls: Vec<Call>, block: Option<BlockId>) -> Result<Vec<CallOutcome>> {
        if calls.is_empty() {
            return Ok(Vec::new());
        }

        // Coalesce identical calls to reduce load
        let mut unique_calls = indexmap::IndexSet::new();
        let mut original_indices = Vec::with_capacity(calls.len());
        for call in &calls {
            let (index, _) = unique_calls.insert_full(call.clone());
            original_indices.push(index);
        }
        let unique_call_vec: Vec<Call> = unique_calls.into_iter().collect();
        debug!(
            "Multicall coalesced {} calls into {}",
            calls.len(),
            unique_call_vec.len()
        );

        let mut all_results_unique = Vec::with_capacity(unique_call_vec.len());
        for call_chunk in unique_call_vec.chunks(self.batch_size) {
            metrics::record_multicall_batch_size(call_chunk.len() as f64);
            let outcomes = self.execute_aggregate3(call_chunk, block).await?;
            if outcomes.len() != call_chunk.len() {
                anyhow::bail!(
                    "multicall returned {} results for {} calls",
                    outcomes.len(),
                    call_chunk.len()
                );
            }
            all_results_unique.extend(outcomes);
        }

        Ok(original_indices
            .into_iter()
            .map(|index| all_results_unique[index].clone())
            .collect())
    }

    async fn execute_aggregate3(
        &self,
        calls: &[Call],
        block: Option<BlockId>,
    ) -> Result<Vec<CallOutcome>> {
        // Call3 struct: (address target, bool allowFailure, bytes callData)
        let call_tokens = calls
            .iter()
            .map(|call| {
                Token::Tuple(vec![
                    Token::Address(call.target),
                    Token::Bool(true),
                    Token::Bytes(call.call_data.to_vec()),
                ])
            })
            .collect();

        let function = aggregate3_function();
        let calldata = function.encode_input(&[Token::Array(call_tokens)])?;

        let tx_request = TransactionRequest::new()
            .to(self.multicall_address)
            .data(calldata);
        let typed_tx: ethers::types::transaction::eip2718::TypedTransaction = tx_request.into();

        let response = tokio::time::timeout(self.timeout, self.provider.call(&typed_tx, block))
            .await
            .map_err(|_| anyhow::anyhow!("multicall timed out after {:?}", self.timeout))??;

        let results_array = function
            .decode_output(&response)?
            .into_iter()
            .next()
            .and_then(|t| t.into_array())
            .ok_or_else(|| anyhow::anyhow!("Invalid multicall response format"))?;

        let mut outcomes = Vec::with_capacity(results_array.len());
        for result_token in results_array {
            // Result struct: (bool success, bytes returnData)
            match result_token {
                Token::Tuple(tuple) if tuple.len() == 2 => {
                    let mut it = tuple.into_iter();
                    let success = it.next().and_then(|t| t.into_bool()).unwrap_or(false);
                    let return_data = it.next().and_then(|t| t.into_bytes()).unwrap_or_default();
                    outcomes.push(CallOutcome {
                        success,
                        return_data: Bytes::from(return_data),
                    });
                }
                other => anyhow::bail!("unexpected aggregate3 result token: {:?}", other),
            }
        }
        Ok(outcomes)
    }
}

#[allow(deprecated)]
fn aggregate3_function() -> Function {
    Function {
        name: "aggregate3".to_string(),
        inputs: vec![Param {
            name: "calls".to_string(),
            kind: ParamType::Array(Box::new(ParamType::Tuple(vec![
                ParamType::Address,
                ParamType::Bool,
                ParamType::Bytes,
            ]))),
            internal_type: None,
        }],
        outputs: vec![Param {
            name: "returnData".to_string(),
            kind: ParamType::Array(Box::new(ParamType::Tuple(vec![
                ParamType::Bool,
                ParamType::Bytes,
            ]))),
            internal_type: None,
        }],
        constant: None,
        state_mutability: StateMutability::Payable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn revert_data(reason: &str) -> Vec<u8> {
        let mut data = ERROR_STRING_SELECTOR.to_vec();
        data.extend(ethers::abi::encode(&[Token::String(reason.to_string())]));
        data
    }

    #[test]
    fn decodes_revert_reason() {
        assert_eq!(
            decode_revert_reason(&revert_data("Stale data")).as_deref(),
            Some("Stale data")
        );
        assert_eq!(decode_revert_reason(&[0xde, 0xad]), None);
    }

    #[test]
    fn failed_outcome_carries_reason() {
        let function = aggregate3_function();
        let outcome = CallOutcome {
            success: false,
            return_data: Bytes::from(revert_data("Stale data")),
        };
        let err = outcome.decode(&function).unwrap_err();
        assert!(err.to_string().contains("Stale data"));
        assert!(err.to_string().starts_with("aggregate3 reverted"));
    }

    #[test]
    fn encodes_call() {
        let function = aggregate3_function();
        let call = Call::encode(Address::zero(), &function, &[Token::Array(vec![])]).unwrap();
        assert_eq!(&call.call_data[..4], &function.short_signature()[..]);
    }
}
