//! Nonce management for reliable transaction submission
//!
//! Handles:
//! - Per-account serialization of nonce reservation
//! - Release of nonces whose transaction never reached the network
//! - Gap tracking and reconciliation against the network nonce

use crate::chain::{NetworkEndpoint, RawFailure};

use dashmap::DashMap;
use ethers::types::Address;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Per-account nonce state, mutated only through `NonceAllocator`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountState {
    /// Highest nonce known to be included, if any
    pub confirmed: Option<u64>,
    /// Next nonce to hand out when nothing is reclaimable
    pub next: u64,
    /// Reserved and not yet confirmed or released
    pub outstanding: BTreeSet<u64>,
    /// Released below the top; unusable until reconciled
    pub gaps: BTreeSet<u64>,
    /// Gaps the network confirmed as still unused
    pub reclaimable: BTreeSet<u64>,
    synced: bool,
}

/// Outcome of releasing a reserved nonce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Released {
    /// Was the highest reservation; handed out again next
    Reusable,
    /// Sits below other reservations; resync reconciles it
    Gap,
}

/// Serializes nonce assignment per account
pub struct NonceAllocator {
    endpoint: Arc<dyn NetworkEndpoint>,
    accounts: DashMap<Address, Arc<Mutex<AccountState>>>,
}

impl NonceAllocator {
    pub fn new(endpoint: Arc<dyn NetworkEndpoint>) -> Self {
        Self {
            endpoint,
            accounts: DashMap::new(),
        }
    }

    /// Lock handle of an account; never holds the map guard across an await
    fn account(&self, account: Address) -> Arc<Mutex<AccountState>> {
        self.accounts.entry(account).or_default().clone()
    }

    /// Load the network nonce for an account ahead of its first reservation
    pub async fn register(&self, account: Address) -> Result<u64, RawFailure> {
        let state = self.account(account);
        let mut state = state.lock().await;
        let remote = self.endpoint.transaction_count(account).await?;
        state.apply_remote(remote);
        state.synced = true;
        debug!("Initialized nonce for {:?}: {}", account, state.next);
        Ok(state.next)
    }

    /// Reserve the next nonce. Waits for the account's serialization point
    /// and never fails; a failed sync falls back to local state.
    ///
    /// Open gaps are reconciled against the network first: a released nonce
    /// that is still unused holds back every later one, so it is handed out
    /// again before the counter moves on.
    pub async fn reserve(&self, account: Address) -> u64 {
        let state = self.account(account);
        let mut state = state.lock().await;

        if !state.synced || !state.gaps.is_empty() {
            match self.endpoint.transaction_count(account).await {
                Ok(remote) => {
                    if !state.gaps.is_empty() {
                        info!(
                            "Reconciling nonce gaps {:?} for {:?}, network at {}",
                            state.gaps, account, remote
                        );
                        crate::metrics::record_nonce_resync();
                    }
                    state.reconcile(remote);
                }
                Err(e) => warn!(
                    "Failed to fetch nonce for {:?}, using local {}: {}",
                    account, state.next, e
                ),
            }
        }

        let nonce = match state.reclaimable.pop_first() {
            Some(nonce) => nonce,
            None => {
                let nonce = state.next;
                state.next += 1;
                nonce
            }
        };
        state.outstanding.insert(nonce);

        debug!("Allocated nonce {} for {:?}", nonce, account);
        nonce
    }

    /// Confirm a nonce (transaction mined)
    pub async fn confirm(&self, account: Address, nonce: u64) {
        let state = self.account(account);
        let mut state = state.lock().await;
        state.outstanding.remove(&nonce);
        state.gaps.remove(&nonce);
        state.reclaimable.remove(&nonce);
        if state.confirmed.map_or(true, |confirmed| nonce > confirmed) {
            state.confirmed = Some(nonce);
        }
        if state.next <= nonce {
            state.next = nonce + 1;
        }
    }

    /// Release a nonce whose transaction never reached the network
    pub async fn release(&self, account: Address, nonce: u64) -> Released {
        let state = self.account(account);
        let mut state = state.lock().await;
        state.release(account, nonce)
    }

    /// Release from synchronous code, such as the drop of a cancelled operation.
    /// Applied at once when the account is idle, otherwise on the runtime.
    pub fn release_detached(&self, account: Address, nonce: u64) {
        let state = self.account(account);
        if let Ok(mut guard) = state.try_lock() {
            guard.release(account, nonce);
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    state.lock().await.release(account, nonce);
                });
            }
            Err(_) => warn!(
                "Nonce {} for {:?} stays reserved: no runtime to release it",
                nonce, account
            ),
        }
    }

    /// Re-read the network nonce; `next` becomes max(local, remote)
    pub async fn resync(&self, account: Address) -> Result<u64, RawFailure> {
        let state = self.account(account);
        let mut state = state.lock().await;
        let remote = self.endpoint.transaction_count(account).await?;

        if !state.gaps.is_empty() {
            warn!(
                "Nonce gap detected for {:?}: {:?}, network at {}",
                account, state.gaps, remote
            );
        }
        state.reconcile(remote);

        info!("Resynced nonce for {:?}: next {}", account, state.next);
        crate::metrics::record_nonce_resync();
        Ok(state.next)
    }

    /// Current state of an account
    pub async fn snapshot(&self, account: Address) -> AccountState {
        let state = self.account(account);
        let state = state.lock().await;
        state.clone()
    }
}

impl AccountState {
    fn release(&mut self, account: Address, nonce: u64) -> Released {
        if !self.outstanding.remove(&nonce) {
            debug!("Nonce {} for {:?} was not outstanding", nonce, account);
        }

        if nonce + 1 == self.next {
            self.next = nonce;
            // Trailing gaps become the top as well
            while let Some(top) = self.next.checked_sub(1) {
                if self.gaps.remove(&top) || self.reclaimable.remove(&top) {
                    self.next = top;
                } else {
                    break;
                }
            }
            debug!("Released nonce {} for {:?}, next is {}", nonce, account, self.next);
            Released::Reusable
        } else if nonce < self.next {
            self.gaps.insert(nonce);
            warn!("Nonce {} for {:?} released below the top, gap recorded", nonce, account);
            Released::Gap
        } else {
            Released::Reusable
        }
    }

    /// Apply the network nonce; gaps it has not consumed become reclaimable
    fn reconcile(&mut self, remote: u64) {
        self.apply_remote(remote);
        self.synced = true;
        let gaps = std::mem::take(&mut self.gaps);
        self.reclaimable.extend(gaps);
    }

    /// Reconcile with the network's next nonce
    fn apply_remote(&mut self, remote: u64) {
        if self.next < remote {
            self.next = remote;
        }
        if let Some(included) = remote.checked_sub(1) {
            if self.confirmed.map_or(true, |confirmed| included > confirmed) {
                self.confirmed = Some(included);
            }
        }
        self.outstanding.retain(|n| *n >= remote);
        self.gaps.retain(|n| *n >= remote);
        self.reclaimable.retain(|n| *n >= remote);
    }
}
