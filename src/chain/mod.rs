//! Chain module - the boundary between the engine and the RPC endpoint
//!
//! This module provides:
//! - The `NetworkEndpoint` trait every pipeline stage talks to
//! - Raw failure values the classifier consumes
//! - An ethers HTTP implementation with multi-RPC failover

pub mod provider;

pub use provider::ChainProvider;

use async_trait::async_trait;
use ethers::providers::{ProviderError, RpcError};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, TransactionReceipt, H256, U256};
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

/// Unclassified failure as reported by the endpoint or a local stage
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RawFailure {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("rpc error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<Bytes>,
    },

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("receipt not observed before timeout")]
    ReceiptTimeout,

    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl RawFailure {
    /// Node-side revert with optional ABI-encoded payload
    pub fn revert(message: impl Into<String>, data: Option<Bytes>) -> Self {
        RawFailure::Rpc {
            code: 3,
            message: message.into(),
            data,
        }
    }

    pub fn rpc(code: i64, message: impl Into<String>) -> Self {
        RawFailure::Rpc {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Failure below the JSON-RPC layer; another endpoint may succeed
    pub fn is_transport(&self) -> bool {
        matches!(self, RawFailure::Transport(_) | RawFailure::RateLimited(_))
    }
}

impl From<ProviderError> for RawFailure {
    fn from(err: ProviderError) -> Self {
        if let Some(response) = err.as_error_response() {
            return RawFailure::Rpc {
                code: response.code,
                message: response.message.clone(),
                data: response.as_revert_data(),
            };
        }

        let message = err.to_string();
        let lower = message.to_lowercase();
        if lower.contains("429") || lower.contains("rate limit") || lower.contains("too many requests")
        {
            RawFailure::RateLimited(message)
        } else {
            RawFailure::Transport(message)
        }
    }
}

/// Gas price types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GasPrice {
    Legacy(U256),
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}

impl GasPrice {
    /// Highest price per gas this fee setting can pay
    pub fn max_per_gas(&self) -> U256 {
        match self {
            GasPrice::Legacy(price) => *price,
            GasPrice::Eip1559 {
                max_fee_per_gas, ..
            } => *max_fee_per_gas,
        }
    }
}

/// Log record emitted by an included transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub address: Address,
    pub topics: Vec<H256>,
    pub data: Bytes,
}

/// Confirmation record of an included transaction; never mutated after creation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub tx_hash: H256,
    pub block_number: u64,
    pub block_hash: Option<H256>,
    pub success: bool,
    pub gas_used: U256,
    pub logs: Vec<LogRecord>,
}

impl From<TransactionReceipt> for Receipt {
    fn from(receipt: TransactionReceipt) -> Self {
        Self {
            tx_hash: receipt.transaction_hash,
            block_number: receipt.block_number.map(|b| b.as_u64()).unwrap_or_default(),
            block_hash: receipt.block_hash,
            success: receipt.status.map(|s| s.as_u64() == 1).unwrap_or(false),
            gas_used: receipt.gas_used.unwrap_or_default(),
            logs: receipt
                .logs
                .into_iter()
                .map(|log| LogRecord {
                    address: log.address,
                    topics: log.topics,
                    data: log.data,
                })
                .collect(),
        }
    }
}

/// Remote procedure endpoint consumed by the pipeline and the read paths
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NetworkEndpoint: Send + Sync {
    fn chain_id(&self) -> u64;

    async fn block_number(&self) -> Result<u64, RawFailure>;

    /// Timestamp of the latest block, in seconds since the epoch
    async fn block_timestamp(&self) -> Result<u64, RawFailure>;

    /// Simulate a call; `block` pins the state, `None` means latest
    async fn call(&self, tx: &TypedTransaction, block: Option<u64>) -> Result<Bytes, RawFailure>;

    async fn estimate_gas(&self, tx: &TypedTransaction) -> Result<U256, RawFailure>;

    /// Fee parameters under the fee model in effect
    async fn gas_price(&self) -> Result<GasPrice, RawFailure>;

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, RawFailure>;

    async fn transaction_receipt(&self, tx_hash: H256) -> Result<Option<Receipt>, RawFailure>;

    /// Next nonce of `address`, including pending transactions
    async fn transaction_count(&self, address: Address) -> Result<u64, RawFailure>;
}
