//! Sceptre liquid staking (FLR → sFLR)

use super::{abi, decoded, require, unsupported, ConnectorContext, ProtocolConnector, Request};
use crate::error::{AgentError, AgentResult};
use crate::math::{Eligibility, ExchangeRate, WithdrawalRequest};
use crate::operation::{Operation, OperationKind, Protocol};
use crate::tx::engine::Execution;

use chrono::{DateTime, Utc};
use ethers::abi::Token;
use ethers::types::{Address, U256};
use tracing::info;

const PROTOCOL: Protocol = Protocol::Sceptre;

pub struct Sceptre {
    ctx: ConnectorContext,
}

impl Sceptre {
    pub fn new(ctx: ConnectorContext) -> Self {
        Self { ctx }
    }

    fn sflr(&self, operation: &'static str) -> AgentResult<Address> {
        require(self.ctx.contracts.sceptre_sflr, PROTOCOL, operation, "Sceptre sFLR")
    }

    async fn read_uint(&self, operation: &'static str, signature: &str, args: &[Token]) -> AgentResult<U256> {
        let to = self.sflr(operation)?;
        let output = self
            .ctx
            .read(PROTOCOL, operation, to, abi::encode_call(signature, args))
            .await?;
        decoded(PROTOCOL, operation, abi::decode_uint(&output))
    }

    /// Payable `submit()` carrying `amount` FLR
    pub fn encode_stake(&self, amount: U256) -> AgentResult<Operation> {
        let to = self.sflr("stake")?;
        Ok(Operation::new(
            PROTOCOL,
            OperationKind::TransferAndLock,
            "stake",
            to,
            abi::encode_call("submit()", &[]),
        )
        .with_value(amount))
    }

    pub fn encode_request_withdrawal(&self, shares: U256) -> AgentResult<Operation> {
        let to = self.sflr("request_withdrawal")?;
        Ok(Operation::new(
            PROTOCOL,
            OperationKind::RequestWithdrawal,
            "request_withdrawal",
            to,
            abi::encode_call("requestWithdrawal(uint256)", &[Token::Uint(shares)]),
        ))
    }

    pub fn encode_claim_withdrawal(&self, request_index: u64) -> AgentResult<Operation> {
        let to = self.sflr("claim_withdrawal")?;
        Ok(Operation::new(
            PROTOCOL,
            OperationKind::ClaimWithdrawal,
            "claim_withdrawal",
            to,
            abi::encode_call("claimWithdrawal(uint256)", &[Token::Uint(request_index.into())]),
        ))
    }

    /// Stake FLR for sFLR
    pub async fn stake(&self, amount: U256) -> AgentResult<Execution> {
        info!("Staking {} wei FLR with Sceptre", amount);
        self.ctx.execute(self.encode_stake(amount)?).await
    }

    /// Start the unlock cooldown for `shares` sFLR
    pub async fn request_withdrawal(&self, shares: U256) -> AgentResult<Execution> {
        info!("Requesting withdrawal of {} sFLR shares", shares);
        self.ctx.execute(self.encode_request_withdrawal(shares)?).await
    }

    /// Claim an unlock request once its cooldown has elapsed
    pub async fn claim_withdrawal(&self, request_index: u64) -> AgentResult<Execution> {
        let operation = self.encode_claim_withdrawal(request_index)?;
        let request = self.unlock_request(request_index).await?;
        if request.amount.is_zero() {
            return Err(AgentError::configuration(
                PROTOCOL,
                "claim_withdrawal",
                format!("unlock request {} holds no shares", request_index),
            ));
        }
        let now = self.ctx.chain_time(PROTOCOL, "claim_withdrawal").await?;
        request
            .ensure_claimable(0, now)
            .map_err(|e| AgentError::configuration(PROTOCOL, "claim_withdrawal", e.to_string()))?;

        info!("Claiming Sceptre unlock request {}", request_index);
        self.ctx.execute(operation).await
    }

    /// Unlock request `request_index` of the signing account
    pub async fn unlock_request(&self, request_index: u64) -> AgentResult<WithdrawalRequest> {
        const OPERATION: &str = "claim_withdrawal";
        let account = self.ctx.require_account(PROTOCOL, OPERATION)?;
        let to = self.sflr(OPERATION)?;

        let output = self
            .ctx
            .read(
                PROTOCOL,
                OPERATION,
                to,
                abi::encode_call(
                    "userUnlockRequests(address,uint256)",
                    &[Token::Address(account), Token::Uint(request_index.into())],
                ),
            )
            .await?;
        let words = decoded(PROTOCOL, OPERATION, abi::decode_uints(&output, 2))?;
        let cooldown = self.read_uint(OPERATION, "cooldownPeriod()", &[]).await?;

        let eligible_at = eligible_at(words[0], cooldown).ok_or_else(|| {
            AgentError::configuration(PROTOCOL, OPERATION, "unlock timestamp out of range")
        })?;
        Ok(WithdrawalRequest {
            amount: words[1],
            period: request_index,
            eligible_from: Eligibility::At(eligible_at),
        })
    }

    pub async fn balance_of(&self, owner: Address) -> AgentResult<U256> {
        self.read_uint("balance_of", "balanceOf(address)", &[Token::Address(owner)])
            .await
    }

    pub async fn total_pooled_flr(&self) -> AgentResult<U256> {
        self.read_uint("total_pooled_flr", "getTotalPooledFlr()", &[])
            .await
    }

    pub async fn flr_by_shares(&self, shares: U256) -> AgentResult<U256> {
        self.read_uint("flr_by_shares", "getPooledFlrByShares(uint256)", &[Token::Uint(shares)])
            .await
    }

    pub async fn shares_by_flr(&self, amount: U256) -> AgentResult<U256> {
        self.read_uint("shares_by_flr", "getSharesByPooledFlr(uint256)", &[Token::Uint(amount)])
            .await
    }

    /// Pooled FLR over total sFLR supply
    pub async fn exchange_rate(&self) -> AgentResult<ExchangeRate> {
        let pooled = self.total_pooled_flr().await?;
        let supply = self.read_uint("exchange_rate", "totalSupply()", &[]).await?;
        Ok(ExchangeRate::new(pooled, supply))
    }

    /// sFLR minted for staking `amount`, computed locally from `rate`
    pub fn preview_stake(&self, rate: &ExchangeRate, amount: U256) -> AgentResult<U256> {
        rate.shares_for_assets(amount)
            .map_err(|e| AgentError::configuration(PROTOCOL, "preview_stake", e.to_string()))
    }
}

impl ProtocolConnector for Sceptre {
    fn protocol(&self) -> Protocol {
        PROTOCOL
    }

    fn context(&self) -> &ConnectorContext {
        &self.ctx
    }

    fn encode(&self, request: &Request) -> AgentResult<Operation> {
        match request {
            Request::Stake { amount } => self.encode_stake(*amount),
            Request::RequestWithdrawal { amount } => self.encode_request_withdrawal(*amount),
            Request::ClaimWithdrawal { id } => self.encode_claim_withdrawal(*id),
            other => Err(unsupported(PROTOCOL, other)),
        }
    }
}

fn eligible_at(started_at: U256, cooldown: U256) -> Option<DateTime<Utc>> {
    if started_at > U256::from(i64::MAX as u64) || cooldown > U256::from(i64::MAX as u64) {
        return None;
    }
    let unlock = (started_at.as_u64() as i64).checked_add(cooldown.as_u64() as i64)?;
    DateTime::from_timestamp(unlock, 0)
}
