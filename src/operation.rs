//! Logical protocol operations handed to the execution pipeline

use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, TransactionRequest, U256};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Protocol connector identity, used to attribute every error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Sceptre,
    Cyclo,
    Kinetic,
    Firelight,
    SparkDex,
    Stargate,
}

impl Protocol {
    pub const ALL: [Protocol; 6] = [
        Protocol::Sceptre,
        Protocol::Cyclo,
        Protocol::Kinetic,
        Protocol::Firelight,
        Protocol::SparkDex,
        Protocol::Stargate,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Protocol::Sceptre => "sceptre",
            Protocol::Cyclo => "cyclo",
            Protocol::Kinetic => "kinetic",
            Protocol::Firelight => "firelight",
            Protocol::SparkDex => "sparkdex",
            Protocol::Stargate => "stargate",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Kind tag of an operation. Write kinds carry their gas profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    TransferAndLock,
    MintAgainstCollateral,
    BurnAndUnlock,
    Supply,
    Redeem,
    SwapExactIn,
    SwapExactOut,
    RequestWithdrawal,
    ClaimWithdrawal,
    Query,
}

impl OperationKind {
    /// Protocol-declared gas ceiling used when simulation is unavailable
    pub fn default_gas_ceiling(&self) -> u64 {
        match self {
            OperationKind::TransferAndLock => 200_000,
            OperationKind::MintAgainstCollateral => 400_000,
            OperationKind::BurnAndUnlock => 350_000,
            OperationKind::Supply => 300_000,
            OperationKind::Redeem => 300_000,
            OperationKind::SwapExactIn => 350_000,
            OperationKind::SwapExactOut => 350_000,
            OperationKind::RequestWithdrawal => 250_000,
            OperationKind::ClaimWithdrawal => 200_000,
            OperationKind::Query => 0,
        }
    }

    /// Floor below which a transaction of this kind cannot succeed
    pub fn min_gas(&self) -> u64 {
        match self {
            OperationKind::TransferAndLock => 60_000,
            OperationKind::MintAgainstCollateral => 150_000,
            OperationKind::BurnAndUnlock => 120_000,
            OperationKind::Supply => 100_000,
            OperationKind::Redeem => 100_000,
            OperationKind::SwapExactIn | OperationKind::SwapExactOut => 110_000,
            OperationKind::RequestWithdrawal => 80_000,
            OperationKind::ClaimWithdrawal => 60_000,
            OperationKind::Query => 0,
        }
    }

    pub fn is_write(&self) -> bool {
        !matches!(self, OperationKind::Query)
    }

    pub fn name(&self) -> &'static str {
        match self {
            OperationKind::TransferAndLock => "transfer_and_lock",
            OperationKind::MintAgainstCollateral => "mint_against_collateral",
            OperationKind::BurnAndUnlock => "burn_and_unlock",
            OperationKind::Supply => "supply",
            OperationKind::Redeem => "redeem",
            OperationKind::SwapExactIn => "swap_exact_in",
            OperationKind::SwapExactOut => "swap_exact_out",
            OperationKind::RequestWithdrawal => "request_withdrawal",
            OperationKind::ClaimWithdrawal => "claim_withdrawal",
            OperationKind::Query => "query",
        }
    }
}

/// Slippage or collateral bound enforced by the target contract
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    MinOut(U256),
    MaxIn(U256),
    MinShareRatio(U256),
}

/// One logical protocol call, immutable once handed to the pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub id: Uuid,
    pub protocol: Protocol,
    pub kind: OperationKind,
    /// Connector method name, e.g. "stake"
    pub label: &'static str,
    pub to: Address,
    pub calldata: Bytes,
    pub value: U256,
    pub bound: Option<Bound>,
}

impl Operation {
    pub fn new(
        protocol: Protocol,
        kind: OperationKind,
        label: &'static str,
        to: Address,
        calldata: Bytes,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            protocol,
            kind,
            label,
            to,
            calldata,
            value: U256::zero(),
            bound: None,
        }
    }

    pub fn with_value(mut self, value: U256) -> Self {
        self.value = value;
        self
    }

    pub fn with_bound(mut self, bound: Bound) -> Self {
        self.bound = Some(bound);
        self
    }

    /// Unpriced call used for simulation and revert replay
    pub fn to_call(&self, from: Address) -> TypedTransaction {
        TransactionRequest::new()
            .from(from)
            .to(self.to)
            .data(self.calldata.clone())
            .value(self.value)
            .into()
    }
}
