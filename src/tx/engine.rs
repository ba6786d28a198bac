//! Execution pipeline: estimate → reserve nonce → sign → submit → watch
//!
//! Every stage before acceptance by the network runs under the caller's
//! deadline and gives its nonce back when it fails or is cancelled, unless a
//! send may already have reached the network. Such a transaction, like one the
//! network accepted, is reported with its hash even when the outcome is not
//! yet known.

use super::classify::classify;
use super::gas::GasEstimator;
use super::nonce::NonceAllocator;
use super::receipt::{ReceiptWatcher, WatchOutcome};
use super::nonce::Released;
use super::sender::{Delivery, RetryPolicy, Submitter};
use super::signer::{sign_transaction, SignedTransaction, TransactionSigner, UnsignedTransaction};
use crate::chain::{NetworkEndpoint, Receipt};
use crate::config::ExecutionConfig;
use crate::error::{AgentError, AgentResult, ErrorKind, RevertReason};
use crate::operation::{Operation, OperationKind, Protocol};

use ethers::types::{Address, H256};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Final state of an accepted transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStatus {
    Confirmed(Receipt),
    /// Submitted but not observed before the wait ended; may still confirm
    Unknown,
}

/// Result of a write operation that reached the network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    pub operation_id: Uuid,
    pub protocol: Protocol,
    pub operation: &'static str,
    pub kind: OperationKind,
    pub tx_hash: H256,
    pub nonce: u64,
    pub status: ExecutionStatus,
}

impl Execution {
    pub fn is_confirmed(&self) -> bool {
        matches!(self.status, ExecutionStatus::Confirmed(_))
    }

    pub fn receipt(&self) -> Option<&Receipt> {
        match &self.status {
            ExecutionStatus::Confirmed(receipt) => Some(receipt),
            ExecutionStatus::Unknown => None,
        }
    }

    /// The receipt, or a `Timeout` error carrying the transaction to re-poll
    pub fn into_confirmed(self) -> AgentResult<Receipt> {
        match self.status {
            ExecutionStatus::Confirmed(receipt) => Ok(receipt),
            ExecutionStatus::Unknown => Err(AgentError::new(
                self.protocol,
                self.operation,
                ErrorKind::timeout(format!("outcome of {:?} unknown", self.tx_hash)),
            )
            .with_submission(self.nonce, self.tx_hash)),
        }
    }
}

/// Transaction accepted by the network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submitted {
    pub tx_hash: H256,
    pub nonce: u64,
}

/// Nonce held by one signing attempt. Dropping it unkept, as a cancelled
/// operation does, hands the nonce back unless its bytes may be on the network.
struct Reservation<'a> {
    nonces: &'a NonceAllocator,
    account: Address,
    nonce: u64,
    delivery: &'a Delivery,
    armed: bool,
}

impl Reservation<'_> {
    /// The nonce now belongs to a transaction the network may hold
    fn keep(mut self) {
        self.armed = false;
    }

    async fn release(mut self) -> Released {
        self.armed = false;
        self.nonces.release(self.account, self.nonce).await
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if self.delivery.may_have_reached_network() {
            warn!(
                "Operation dropped while nonce {} of {:?} may be on the network; keeping it",
                self.nonce, self.account
            );
            return;
        }
        debug!("Operation dropped holding nonce {}, releasing it", self.nonce);
        self.nonces.release_detached(self.account, self.nonce);
    }
}

pub struct ExecutionEngine {
    endpoint: Arc<dyn NetworkEndpoint>,
    signer: Arc<dyn TransactionSigner>,
    nonces: Arc<NonceAllocator>,
    gas: GasEstimator,
    submitter: Submitter,
    watcher: ReceiptWatcher,
    config: ExecutionConfig,
}

impl ExecutionEngine {
    pub fn new(
        endpoint: Arc<dyn NetworkEndpoint>,
        signer: Arc<dyn TransactionSigner>,
        config: &ExecutionConfig,
        max_gas_price_gwei: u64,
    ) -> Self {
        let nonces = Arc::new(NonceAllocator::new(endpoint.clone()));
        Self::with_allocator(endpoint, signer, nonces, config, max_gas_price_gwei)
    }

    /// Engine sharing a nonce allocator with other engines of the same account
    pub fn with_allocator(
        endpoint: Arc<dyn NetworkEndpoint>,
        signer: Arc<dyn TransactionSigner>,
        nonces: Arc<NonceAllocator>,
        config: &ExecutionConfig,
        max_gas_price_gwei: u64,
    ) -> Self {
        let submitter = Submitter::new(
            endpoint.clone(),
            RetryPolicy::from_config(config),
            config.submit_timeout(),
        );
        let watcher = ReceiptWatcher::new(
            endpoint.clone(),
            config.receipt_poll_interval(),
            config.confirmations,
        );

        Self {
            endpoint,
            signer,
            nonces,
            gas: GasEstimator::new(config, max_gas_price_gwei),
            submitter,
            watcher,
            config: config.clone(),
        }
    }

    /// Signing account
    pub fn account(&self) -> Address {
        self.signer.address()
    }

    pub fn nonces(&self) -> &Arc<NonceAllocator> {
        &self.nonces
    }

    pub fn endpoint(&self) -> &Arc<dyn NetworkEndpoint> {
        &self.endpoint
    }

    /// Run `operation` under the configured operation timeout
    pub async fn execute(&self, operation: Operation) -> AgentResult<Execution> {
        let deadline = Instant::now() + self.config.operation_timeout();
        self.execute_with_deadline(operation, deadline).await
    }

    /// Run `operation`, giving up on unsubmitted work at `deadline`
    pub async fn execute_with_deadline(
        &self,
        operation: Operation,
        deadline: Instant,
    ) -> AgentResult<Execution> {
        let result = self.run(&operation, deadline).await;
        if let Err(e) = &result {
            warn!(
                "{} {} ({}) failed: {} (fees spent: {})",
                operation.protocol,
                operation.label,
                operation.id,
                e.kind,
                e.fees_spent()
            );
            crate::metrics::record_failed(operation.protocol, &e.kind);
        }
        result
    }

    async fn run(&self, operation: &Operation, deadline: Instant) -> AgentResult<Execution> {
        let submitted_at = Instant::now();
        let Submitted { tx_hash, nonce } = self.submit(operation, deadline).await?;

        let remaining = deadline.saturating_duration_since(Instant::now());
        let wait = std::cmp::min(remaining, self.config.receipt_timeout());
        let account = self.account();

        let status = match self.watcher.wait(tx_hash, wait).await {
            WatchOutcome::Confirmed(receipt) => {
                self.nonces.confirm(account, nonce).await;
                crate::metrics::record_confirmed(
                    operation.protocol,
                    operation.kind,
                    submitted_at.elapsed().as_secs_f64(),
                );
                ExecutionStatus::Confirmed(receipt)
            }
            WatchOutcome::Reverted(receipt) => {
                self.nonces.confirm(account, nonce).await;
                let reason = self.revert_reason(operation, receipt.block_number).await;
                return Err(AgentError::new(
                    operation.protocol,
                    operation.label,
                    ErrorKind::revert(
                        reason,
                        format!(
                            "transaction {:?} reverted in block {}",
                            tx_hash, receipt.block_number
                        ),
                    ),
                )
                .with_submission(nonce, tx_hash));
            }
            WatchOutcome::TimedOut { last_state, .. } => {
                warn!(
                    "{} {} submitted as {:?}, outcome unknown ({:?})",
                    operation.protocol, operation.label, tx_hash, last_state
                );
                ExecutionStatus::Unknown
            }
        };

        Ok(Execution {
            operation_id: operation.id,
            protocol: operation.protocol,
            operation: operation.label,
            kind: operation.kind,
            tx_hash,
            nonce,
            status,
        })
    }

    /// Drive `operation` up to acceptance by the network
    pub async fn submit(&self, operation: &Operation, deadline: Instant) -> AgentResult<Submitted> {
        let fail = |kind: ErrorKind| AgentError::new(operation.protocol, operation.label, kind);
        let account = self.account();
        let chain_id = self.endpoint.chain_id();
        let policy = self.submitter.policy();

        // Estimation runs first so a doomed call never takes a nonce
        let mut plan = timeout_at(
            deadline,
            self.gas
                .estimate(self.endpoint.as_ref(), operation, account, policy),
        )
        .await
        .map_err(|_| fail(ErrorKind::timeout("deadline elapsed during gas estimation")))?
        .map_err(fail)?;

        let mut conflicts = 0;
        loop {
            let nonce = timeout_at(deadline, self.nonces.reserve(account))
                .await
                .map_err(|_| fail(ErrorKind::timeout("deadline elapsed waiting for a nonce")))?;
            let delivery = Delivery::default();
            let reservation = Reservation {
                nonces: &self.nonces,
                account,
                nonce,
                delivery: &delivery,
                armed: true,
            };

            let unsigned = UnsignedTransaction {
                to: operation.to,
                data: operation.calldata.clone(),
                value: operation.value,
                nonce,
                gas_limit: plan.gas_limit,
                fees: plan.fees,
                chain_id,
            };
            let signed = match sign_transaction(self.signer.as_ref(), unsigned).await {
                Ok(signed) => signed,
                Err(raw) => {
                    reservation.release().await;
                    return Err(fail(classify(&raw)));
                }
            };

            debug!(
                "Submitting {} {} with nonce {} and {:?} gas limit {} (max cost {} wei)",
                operation.protocol,
                operation.label,
                nonce,
                plan.source,
                plan.gas_limit,
                GasEstimator::max_cost(plan.gas_limit, &plan.fees)
            );

            let kind = match timeout_at(deadline, self.submitter.submit(&signed, &delivery)).await {
                Ok(Ok(tx_hash)) => {
                    reservation.keep();
                    info!(
                        "{} {} accepted as {:?} (nonce {})",
                        operation.protocol, operation.label, tx_hash, nonce
                    );
                    crate::metrics::record_submitted(operation.protocol, operation.kind);
                    return Ok(Submitted { tx_hash, nonce });
                }
                Ok(Err(kind)) => kind,
                Err(_) => ErrorKind::timeout(
                    "deadline elapsed before the network accepted the transaction",
                ),
            };

            if let Some(submitted) = self.in_doubt(operation, &signed, &delivery, &kind).await {
                reservation.keep();
                crate::metrics::record_submitted(operation.protocol, operation.kind);
                return Ok(submitted);
            }

            match kind {
                ErrorKind::NonceConflict { cause }
                    if conflicts < self.config.nonce_conflict_retries =>
                {
                    conflicts += 1;
                    warn!("Nonce {} rejected ({}), resyncing", nonce, cause);
                    reservation.release().await;
                    if let Err(e) = self.nonces.resync(account).await {
                        warn!("Nonce resync for {:?} failed: {}", account, e);
                    }
                    plan = timeout_at(
                        deadline,
                        self.gas.reprice(plan, self.endpoint.as_ref(), policy),
                    )
                    .await
                    .map_err(|_| fail(ErrorKind::timeout("deadline elapsed fetching fees")))?
                    .map_err(fail)?;
                }
                kind => {
                    reservation.release().await;
                    return Err(fail(kind));
                }
            }
        }
    }

    /// Treat `signed` as submitted when it is already included, or when a send
    /// may have reached the network without an answer. Those bytes keep their
    /// nonce and are never re-signed.
    async fn in_doubt(
        &self,
        operation: &Operation,
        signed: &SignedTransaction,
        delivery: &Delivery,
        kind: &ErrorKind,
    ) -> Option<Submitted> {
        let ambiguous = delivery.may_have_reached_network();
        if !ambiguous && !matches!(kind, ErrorKind::NonceConflict { .. }) {
            return None;
        }
        let submitted = Submitted {
            tx_hash: signed.hash,
            nonce: signed.nonce(),
        };

        let lookup = timeout(
            self.config.submit_timeout(),
            self.endpoint.transaction_receipt(signed.hash),
        )
        .await;
        match lookup {
            Ok(Ok(Some(receipt))) => {
                info!(
                    "{} {} already included as {:?} in block {} (nonce {})",
                    operation.protocol,
                    operation.label,
                    signed.hash,
                    receipt.block_number,
                    submitted.nonce
                );
                return Some(submitted);
            }
            Ok(Ok(None)) => {}
            Ok(Err(e)) => debug!("Receipt lookup for {:?} failed: {}", signed.hash, e),
            Err(_) => debug!("Receipt lookup for {:?} timed out", signed.hash),
        }

        if ambiguous {
            warn!(
                "{} {} may have reached the network as {:?} (nonce {}) before failing: {}",
                operation.protocol, operation.label, signed.hash, submitted.nonce, kind
            );
            return Some(submitted);
        }
        None
    }

    /// Wait again for a transaction whose outcome was unknown
    pub async fn watch(&self, tx_hash: H256, timeout: Duration) -> WatchOutcome {
        self.watcher.wait(tx_hash, timeout).await
    }

    /// Replay a reverted call against the parent block to recover its reason
    async fn revert_reason(&self, operation: &Operation, block: u64) -> RevertReason {
        let call = operation.to_call(self.account());
        match self.endpoint.call(&call, Some(block.saturating_sub(1))).await {
            Err(raw) => match classify(&raw) {
                ErrorKind::Revert { reason, .. } => reason,
                _ => RevertReason::opaque(),
            },
            Ok(_) => RevertReason::opaque(),
        }
    }
}
