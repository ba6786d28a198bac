//! Fixed-point conversion arithmetic shared by the vault-style protocols
//!
//! All divisions truncate toward zero to match on-chain integer semantics.
//! Products are taken in 512 bits so `a * b / c` never overflows midway.

use chrono::{DateTime, Utc};
use ethers::types::{U256, U512};
use thiserror::Error;

/// 1e18, the fixed-point base used by every supported protocol
pub const WAD: U256 = U256([1_000_000_000_000_000_000, 0, 0, 0]);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MathError {
    #[error("division by zero")]
    DivisionByZero,

    #[error("result does not fit in 256 bits")]
    Overflow,

    #[error("initial rate must be non-zero")]
    ZeroInitialRate,

    #[error("receipt {receipt_id} holds {recorded}, refusing to burn {requested}")]
    BurnMismatch {
        receipt_id: U256,
        recorded: U256,
        requested: U256,
    },

    #[error("withdrawal from period {period} is not claimable yet: {detail}")]
    NotClaimable { period: u64, detail: String },
}

/// `a * b / denominator`, floored
pub fn mul_div_floor(a: U256, b: U256, denominator: U256) -> Result<U256, MathError> {
    if denominator.is_zero() {
        return Err(MathError::DivisionByZero);
    }
    let quotient = a.full_mul(b) / U512::from(denominator);
    U256::try_from(quotient).map_err(|_| MathError::Overflow)
}

/// Share/asset ratio of a vault, with the rate used while it is empty
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeRate {
    total_assets: U256,
    total_shares: U256,
    /// Shares minted per asset while the vault is empty, scaled by `WAD`
    initial_shares_per_asset: U256,
}

impl ExchangeRate {
    /// Rate from vault totals, starting at 1:1
    pub fn new(total_assets: U256, total_shares: U256) -> Self {
        Self {
            total_assets,
            total_shares,
            initial_shares_per_asset: WAD,
        }
    }

    /// Rate from a cToken-style mantissa: assets per share scaled by `WAD`
    pub fn from_mantissa(assets_per_share: U256) -> Self {
        Self::new(assets_per_share, WAD)
    }

    pub fn with_initial_rate(mut self, shares_per_asset: U256) -> Self {
        self.initial_shares_per_asset = shares_per_asset;
        self
    }

    pub fn total_assets(&self) -> U256 {
        self.total_assets
    }

    pub fn total_shares(&self) -> U256 {
        self.total_shares
    }

    /// Shares minted for `assets`. Uses the initial rate while `total_assets == 0`.
    pub fn shares_for_assets(&self, assets: U256) -> Result<U256, MathError> {
        if self.total_assets.is_zero() {
            return mul_div_floor(assets, self.initial_shares_per_asset, WAD);
        }
        mul_div_floor(assets, self.total_shares, self.total_assets)
    }

    /// Assets redeemable for `shares`. Uses the initial rate while `total_shares == 0`.
    pub fn assets_for_shares(&self, shares: U256) -> Result<U256, MathError> {
        if self.total_shares.is_zero() {
            if self.initial_shares_per_asset.is_zero() {
                return Err(MathError::ZeroInitialRate);
            }
            return mul_div_floor(shares, WAD, self.initial_shares_per_asset);
        }
        mul_div_floor(shares, self.total_assets, self.total_shares)
    }

    /// Assets per one whole share, scaled by `WAD`
    pub fn assets_per_share(&self) -> Result<U256, MathError> {
        self.assets_for_shares(WAD)
    }

    /// True if this rate is at least `earlier` (yield never decreases the rate)
    pub fn is_not_below(&self, earlier: &ExchangeRate) -> bool {
        if self.total_shares.is_zero() || earlier.total_shares.is_zero() {
            return true;
        }
        self.total_assets.full_mul(earlier.total_shares)
            >= earlier.total_assets.full_mul(self.total_shares)
    }
}

/// Leveraged-vault receipt id: the price captured at lock time, scaled by `WAD`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReceiptId(pub U256);

impl ReceiptId {
    pub fn from_price(price: U256) -> Self {
        Self(price)
    }

    pub fn price(&self) -> U256 {
        self.0
    }

    /// Synthetic tokens minted when locking `assets` at this price
    pub fn shares_for_assets(&self, assets: U256) -> Result<U256, MathError> {
        mul_div_floor(assets, self.0, WAD)
    }

    /// Redemption must burn exactly the balance recorded under this id
    pub fn ensure_exact_burn(&self, recorded: U256, requested: U256) -> Result<(), MathError> {
        if recorded != requested {
            return Err(MathError::BurnMismatch {
                receipt_id: self.0,
                recorded,
                requested,
            });
        }
        Ok(())
    }
}

/// When a withdrawal request becomes claimable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    /// Claimable once the current period reaches this index
    Period(u64),
    /// Claimable from this instant
    At(DateTime<Utc>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithdrawalRequest {
    pub amount: U256,
    /// Originating period, or request index for queue-based protocols
    pub period: u64,
    pub eligible_from: Eligibility,
}

impl WithdrawalRequest {
    pub fn is_claimable(&self, current_period: u64, now: DateTime<Utc>) -> bool {
        match self.eligible_from {
            Eligibility::Period(period) => current_period >= period,
            Eligibility::At(at) => now >= at,
        }
    }

    pub fn ensure_claimable(&self, current_period: u64, now: DateTime<Utc>) -> Result<(), MathError> {
        if self.is_claimable(current_period, now) {
            return Ok(());
        }
        let detail = match self.eligible_from {
            Eligibility::Period(period) => {
                format!("current period is {}, eligible from {}", current_period, period)
            }
            Eligibility::At(at) => format!("eligible from {}", at.to_rfc3339()),
        };
        Err(MathError::NotClaimable {
            period: self.period,
            detail,
        })
    }
}
