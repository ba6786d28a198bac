//! Transaction submission with bounded retry of transient failures

use super::classify::classify;
use super::signer::SignedTransaction;
use crate::chain::{NetworkEndpoint, RawFailure};
use crate::config::ExecutionConfig;
use crate::error::ErrorKind;

use ethers::types::H256;
use rand::Rng;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Exponential backoff with jitter and a bounded attempt count
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Extra random delay as a fraction of the backoff
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &ExecutionConfig) -> Self {
        Self {
            max_attempts: config.max_submit_attempts.max(1),
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            jitter: config.retry_jitter.clamp(0.0, 1.0),
        }
    }

    /// Backoff before retrying after failed attempt `attempt` (1-based), without jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let delay = self.base_delay.saturating_mul(1u32 << exponent);
        std::cmp::min(delay, self.max_delay)
    }

    /// Backoff plus up to `jitter` of itself
    pub fn delay(&self, attempt: u32) -> Duration {
        let backoff = self.backoff(attempt);
        if self.jitter <= 0.0 {
            return backoff;
        }
        let factor = rand::thread_rng().gen_range(0.0..=self.jitter);
        backoff + backoff.mul_f64(factor)
    }

    /// Run `call` until it succeeds, fails non-transiently, or the attempts run out
    pub async fn retry<T, F, Fut>(&self, stage: &'static str, mut call: F) -> Result<T, ErrorKind>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RawFailure>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let raw = match call().await {
                Ok(value) => return Ok(value),
                Err(raw) => raw,
            };

            let kind = classify(&raw);
            if !kind.is_retryable() {
                return Err(kind);
            }
            if attempt >= self.max_attempts {
                warn!("{} failed after {} attempts: {}", stage, attempt, raw);
                return Err(ErrorKind::SubmissionFailed {
                    attempts: attempt,
                    last: Box::new(kind),
                });
            }

            let delay = self.delay(attempt);
            warn!(
                "{} attempt {}/{} failed: {}, retrying in {:?}",
                stage, attempt, self.max_attempts, raw, delay
            );
            crate::metrics::record_retry(stage);
            sleep(delay).await;
        }
    }
}

/// Whether a signed transaction may have reached the network.
///
/// A send that timed out, lost its connection, or was dropped mid-flight
/// leaves the bytes possibly accepted; only a definite answer from the node
/// rules that out.
#[derive(Debug, Default)]
pub struct Delivery {
    in_flight: AtomicBool,
    ambiguous: AtomicBool,
}

impl Delivery {
    /// True when some attempt ended without a definite answer
    pub fn may_have_reached_network(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) || self.ambiguous.load(Ordering::SeqCst)
    }

    fn start(&self) {
        self.in_flight.store(true, Ordering::SeqCst);
    }

    fn finish(&self, answered: bool) {
        if !answered {
            self.ambiguous.store(true, Ordering::SeqCst);
        }
        self.in_flight.store(false, Ordering::SeqCst);
    }
}

/// Sends signed transactions, re-sending the same bytes on transient failures
pub struct Submitter {
    endpoint: Arc<dyn NetworkEndpoint>,
    policy: RetryPolicy,
    request_timeout: Duration,
}

impl Submitter {
    pub fn new(endpoint: Arc<dyn NetworkEndpoint>, policy: RetryPolicy, request_timeout: Duration) -> Self {
        Self {
            endpoint,
            policy,
            request_timeout,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Submit a signed transaction. The nonce is fixed, so a re-send can only
    /// be accepted once; a duplicate report counts as acceptance. `delivery`
    /// records attempts that may have reached the network unanswered.
    pub async fn submit(&self, signed: &SignedTransaction, delivery: &Delivery) -> Result<H256, ErrorKind> {
        let endpoint = &self.endpoint;
        let request_timeout = self.request_timeout;

        let tx_hash = self
            .policy
            .retry("submit", move || async move {
                delivery.start();
                let result = timeout(request_timeout, endpoint.send_raw_transaction(signed.raw.clone())).await;
                match result {
                    Ok(Ok(tx_hash)) => {
                        delivery.finish(true);
                        Ok(tx_hash)
                    }
                    Ok(Err(raw)) if is_already_known(&raw) => {
                        delivery.finish(true);
                        debug!("Transaction {:?} already known to the network", signed.hash);
                        Ok(signed.hash)
                    }
                    Ok(Err(raw)) => {
                        // Transport failures may hide an accepted send
                        delivery.finish(!matches!(raw, RawFailure::Transport(_)));
                        Err(raw)
                    }
                    Err(_) => {
                        delivery.finish(false);
                        Err(RawFailure::Transport(format!(
                            "send timed out after {:?}",
                            request_timeout
                        )))
                    }
                }
            })
            .await?;

        info!("Transaction sent: {:?} (nonce {})", tx_hash, signed.nonce());
        Ok(tx_hash)
    }
}

fn is_already_known(raw: &RawFailure) -> bool {
    match raw {
        RawFailure::Rpc { message, .. } => {
            let lower = message.to_lowercase();
            lower.contains("already known") || lower.contains("known transaction")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{GasPrice, MockNetworkEndpoint};
    use crate::tx::signer::UnsignedTransaction;
    use ethers::types::{Address, Bytes, Signature, U256};
    use std::sync::atomic::AtomicU32;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter: 0.0,
        }
    }

    fn signed() -> SignedTransaction {
        SignedTransaction {
            unsigned: UnsignedTransaction {
                to: Address::repeat_byte(0x12),
                data: Bytes::new(),
                value: U256::zero(),
                nonce: 3,
                gas_limit: U256::from(100_000),
                fees: GasPrice::Legacy(U256::from(25)),
                chain_id: 14,
            },
            signature: Signature {
                r: U256::one(),
                s: U256::one(),
                v: 27,
            },
            raw: Bytes::from(vec![0xf8, 0x01]),
            hash: H256::repeat_byte(0x77),
        }
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = policy(5);
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(4), Duration::from_millis(800));
        assert_eq!(policy.backoff(5), Duration::from_secs(1));
        assert_eq!(policy.backoff(64), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_within_bound() {
        let policy = RetryPolicy {
            jitter: 0.5,
            ..policy(5)
        };
        for attempt in 1..5 {
            let backoff = policy.backoff(attempt);
            let delay = policy.delay(attempt);
            assert!(delay >= backoff);
            assert!(delay <= backoff + backoff / 2 + Duration::from_micros(1));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = policy(5)
            .retry("test", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(RawFailure::Transport("timeout".into()))
                } else {
                    Ok(42)
                }
            })
            .await;
        assert_eq!(result, Ok(42));
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_surfaces_submission_failed() {
        let result: Result<(), _> = policy(3)
            .retry("test", || async { Err(RawFailure::RateLimited("429".into())) })
            .await;
        match result {
            Err(ErrorKind::SubmissionFailed { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert!(last.is_retryable());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_transient_is_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = policy(5)
            .retry("test", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RawFailure::revert("execution reverted: Transaction too old", None))
            })
            .await;
        assert!(matches!(result, Err(ErrorKind::Revert { .. })));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_resends_same_bytes() {
        let tx = signed();
        let expected_raw = tx.raw.clone();
        let mut endpoint = MockNetworkEndpoint::new();
        let mut failures = 2;
        endpoint
            .expect_send_raw_transaction()
            .times(3)
            .returning(move |raw| {
                assert_eq!(raw, expected_raw);
                if failures > 0 {
                    failures -= 1;
                    Err(RawFailure::Transport("connection reset".into()))
                } else {
                    Ok(H256::repeat_byte(0x77))
                }
            });

        let submitter = Submitter::new(Arc::new(endpoint), policy(5), Duration::from_secs(5));
        assert_eq!(submitter.submit(&tx, &Delivery::default()).await, Ok(H256::repeat_byte(0x77)));
    }

    #[tokio::test]
    async fn test_already_known_counts_as_accepted() {
        let mut endpoint = MockNetworkEndpoint::new();
        endpoint
            .expect_send_raw_transaction()
            .returning(|_| Err(RawFailure::rpc(-32000, "already known")));

        let submitter = Submitter::new(Arc::new(endpoint), policy(5), Duration::from_secs(5));
        assert_eq!(submitter.submit(&signed(), &Delivery::default()).await, Ok(H256::repeat_byte(0x77)));
    }

    #[tokio::test]
    async fn test_nonce_conflict_surfaces_immediately() {
        let mut endpoint = MockNetworkEndpoint::new();
        endpoint
            .expect_send_raw_transaction()
            .times(1)
            .returning(|_| Err(RawFailure::rpc(-32000, "nonce too low")));

        let submitter = Submitter::new(Arc::new(endpoint), policy(5), Duration::from_secs(5));
        assert!(matches!(
            submitter.submit(&signed(), &Delivery::default()).await,
            Err(ErrorKind::NonceConflict { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_reply_marks_delivery_ambiguous() {
        let mut endpoint = MockNetworkEndpoint::new();
        let mut sends = 0;
        endpoint.expect_send_raw_transaction().returning(move |_| {
            sends += 1;
            if sends == 1 {
                Err(RawFailure::Transport("connection reset".into()))
            } else {
                Err(RawFailure::RateLimited("429".into()))
            }
        });

        let submitter = Submitter::new(Arc::new(endpoint), policy(3), Duration::from_secs(5));
        let delivery = Delivery::default();
        let result = submitter.submit(&signed(), &delivery).await;
        assert!(matches!(result, Err(ErrorKind::SubmissionFailed { attempts: 3, .. })));
        assert!(delivery.may_have_reached_network());
    }

    #[tokio::test]
    async fn test_definite_rejection_is_not_ambiguous() {
        let mut endpoint = MockNetworkEndpoint::new();
        endpoint
            .expect_send_raw_transaction()
            .returning(|_| Err(RawFailure::rpc(-32000, "nonce too low")));

        let submitter = Submitter::new(Arc::new(endpoint), policy(5), Duration::from_secs(5));
        let delivery = Delivery::default();
        assert!(submitter.submit(&signed(), &delivery).await.is_err());
        assert!(!delivery.may_have_reached_network());
    }
}
