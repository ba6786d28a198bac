//! Receipt polling for submitted transactions

use super::classify::classify;
use crate::chain::{NetworkEndpoint, Receipt};

use ethers::types::H256;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Lifecycle of a submitted transaction as seen by the watcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Submitted,
    Pending,
    Confirmed,
    Reverted,
    TimedOut,
}

impl TxState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxState::Confirmed | TxState::Reverted | TxState::TimedOut)
    }
}

/// Result of watching one transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchOutcome {
    Confirmed(Receipt),
    Reverted(Receipt),
    /// Not observed in time; the transaction may still be included later
    TimedOut { tx_hash: H256, last_state: TxState },
}

impl WatchOutcome {
    pub fn state(&self) -> TxState {
        match self {
            WatchOutcome::Confirmed(_) => TxState::Confirmed,
            WatchOutcome::Reverted(_) => TxState::Reverted,
            WatchOutcome::TimedOut { .. } => TxState::TimedOut,
        }
    }
}

pub struct ReceiptWatcher {
    endpoint: Arc<dyn NetworkEndpoint>,
    poll_interval: Duration,
    /// Blocks, counting the inclusion block, before success is final
    confirmations: u64,
}

impl ReceiptWatcher {
    pub fn new(endpoint: Arc<dyn NetworkEndpoint>, poll_interval: Duration, confirmations: u64) -> Self {
        Self {
            endpoint,
            poll_interval,
            confirmations,
        }
    }

    /// Poll until the transaction reaches a terminal state or `timeout` elapses
    pub async fn wait(&self, tx_hash: H256, timeout: Duration) -> WatchOutcome {
        let deadline = Instant::now() + timeout;
        let mut state = TxState::Submitted;

        loop {
            match self.endpoint.transaction_receipt(tx_hash).await {
                Ok(Some(receipt)) if !receipt.success => {
                    warn!(
                        "Transaction {:?} reverted in block {}",
                        tx_hash, receipt.block_number
                    );
                    return WatchOutcome::Reverted(receipt);
                }
                Ok(Some(receipt)) => {
                    if self.is_final(&receipt).await {
                        info!(
                            "Transaction {:?} confirmed in block {} (gas used {})",
                            tx_hash, receipt.block_number, receipt.gas_used
                        );
                        return WatchOutcome::Confirmed(receipt);
                    }
                    debug!(
                        "Transaction {:?} included in block {}, awaiting confirmations",
                        tx_hash, receipt.block_number
                    );
                    state = TxState::Pending;
                }
                Ok(None) => {
                    if state == TxState::Submitted {
                        debug!("Transaction {:?} pending", tx_hash);
                        state = TxState::Pending;
                    }
                }
                Err(raw) => {
                    let kind = classify(&raw);
                    if kind.is_retryable() {
                        debug!("Receipt poll for {:?} failed: {}", tx_hash, raw);
                    } else {
                        warn!("Receipt poll for {:?} failed: {}", tx_hash, kind);
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                warn!("Transaction {:?} not confirmed within {:?}", tx_hash, timeout);
                return WatchOutcome::TimedOut {
                    tx_hash,
                    last_state: state,
                };
            }
            sleep(std::cmp::min(self.poll_interval, deadline - now)).await;
        }
    }

    async fn is_final(&self, receipt: &Receipt) -> bool {
        if self.confirmations <= 1 {
            return true;
        }
        match self.endpoint.block_number().await {
            Ok(head) => head + 1 >= receipt.block_number + self.confirmations,
            Err(e) => {
                debug!("Failed to read head block: {}", e);
                false
            }
        }
    }
}
