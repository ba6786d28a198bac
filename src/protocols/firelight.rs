//! Firelight XRP staking vault (FXRP → stXRP, ERC-4626 with period-gated withdrawals)

use super::{abi, decoded, require, unsupported, ConnectorContext, ProtocolConnector, Request};
use crate::error::{AgentError, AgentResult};
use crate::math::{Eligibility, WithdrawalRequest};
use crate::operation::{Operation, OperationKind, Protocol};
use crate::tx::engine::Execution;

use ethers::abi::Token;
use ethers::types::{Address, U256};
use tracing::{debug, info};

const PROTOCOL: Protocol = Protocol::Firelight;

pub struct Firelight {
    ctx: ConnectorContext,
}

impl Firelight {
    pub fn new(ctx: ConnectorContext) -> Self {
        Self { ctx }
    }

    fn vault(&self, operation: &'static str) -> AgentResult<Address> {
        require(self.ctx.contracts.firelight_stxrp_vault, PROTOCOL, operation, "Firelight stXRP vault")
    }

    async fn read_uint(&self, operation: &'static str, signature: &str, args: &[Token]) -> AgentResult<U256> {
        let to = self.vault(operation)?;
        let output = self
            .ctx
            .read(PROTOCOL, operation, to, abi::encode_call(signature, args))
            .await?;
        decoded(PROTOCOL, operation, abi::decode_uint(&output))
    }

    pub fn encode_stake(&self, amount: U256, receiver: Address) -> AgentResult<Operation> {
        let to = self.vault("stake")?;
        Ok(Operation::new(
            PROTOCOL,
            OperationKind::TransferAndLock,
            "stake",
            to,
            abi::encode_call(
                "deposit(uint256,address)",
                &[Token::Uint(amount), Token::Address(receiver)],
            ),
        ))
    }

    pub fn encode_request_withdrawal(&self, amount: U256, account: Address) -> AgentResult<Operation> {
        let to = self.vault("request_withdrawal")?;
        Ok(Operation::new(
            PROTOCOL,
            OperationKind::RequestWithdrawal,
            "request_withdrawal",
            to,
            abi::encode_call(
                "withdraw(uint256,address,address)",
                &[Token::Uint(amount), Token::Address(account), Token::Address(account)],
            ),
        ))
    }

    pub fn encode_claim_withdrawal(&self, period: u64) -> AgentResult<Operation> {
        let to = self.vault("claim_withdrawal")?;
        Ok(Operation::new(
            PROTOCOL,
            OperationKind::ClaimWithdrawal,
            "claim_withdrawal",
            to,
            abi::encode_call("claimWithdraw(uint256)", &[Token::Uint(period.into())]),
        ))
    }

    /// Stake `amount` FXRP for stXRP
    pub async fn stake(&self, amount: U256) -> AgentResult<Execution> {
        let account = self.ctx.require_account(PROTOCOL, "stake")?;
        info!("Staking {} FXRP with Firelight", amount);
        self.ctx.execute(self.encode_stake(amount, account)?).await
    }

    /// Queue `amount` FXRP for withdrawal in the current period
    pub async fn request_withdrawal(&self, amount: U256) -> AgentResult<Execution> {
        let account = self.ctx.require_account(PROTOCOL, "request_withdrawal")?;
        info!("Requesting withdrawal of {} FXRP from Firelight", amount);
        self.ctx
            .execute(self.encode_request_withdrawal(amount, account)?)
            .await
    }

    /// Claim the withdrawal queued in `period`. Refused before submission
    /// unless `period` has ended and holds a non-zero amount.
    pub async fn claim_withdrawal(&self, period: u64) -> AgentResult<Execution> {
        let operation = self.encode_claim_withdrawal(period)?;
        let current = self.current_period_for("claim_withdrawal").await?;
        let request = self.withdrawal_request(period).await?;

        let now = self.ctx.chain_time(PROTOCOL, "claim_withdrawal").await?;
        request
            .ensure_claimable(current, now)
            .map_err(|e| AgentError::configuration(PROTOCOL, "claim_withdrawal", e.to_string()))?;
        if request.amount.is_zero() {
            return Err(AgentError::configuration(
                PROTOCOL,
                "claim_withdrawal",
                format!("nothing to claim for period {}", period),
            ));
        }

        info!(
            "Claiming {} FXRP from Firelight period {} (current {})",
            request.amount, period, current
        );
        self.ctx.execute(operation).await
    }

    pub async fn stxrp_balance(&self, owner: Address) -> AgentResult<U256> {
        self.read_uint("stxrp_balance", "balanceOf(address)", &[Token::Address(owner)])
            .await
    }

    /// Total FXRP held by the vault
    pub async fn total_assets(&self) -> AgentResult<U256> {
        self.read_uint("total_assets", "totalAssets()", &[]).await
    }

    pub async fn current_period(&self) -> AgentResult<u64> {
        self.current_period_for("current_period").await
    }

    async fn current_period_for(&self, operation: &'static str) -> AgentResult<u64> {
        let period = self.read_uint(operation, "currentPeriod()", &[]).await?;
        if period > U256::from(u64::MAX) {
            return Err(AgentError::configuration(
                PROTOCOL,
                operation,
                format!("period {} out of range", period),
            ));
        }
        debug!("Firelight current period: {}", period);
        Ok(period.as_u64())
    }

    /// Amount `owner` queued for withdrawal in `period`
    pub async fn pending_withdrawal(&self, period: u64, owner: Address) -> AgentResult<U256> {
        self.read_uint(
            "pending_withdrawal",
            "withdrawalsOf(uint256,address)",
            &[Token::Uint(period.into()), Token::Address(owner)],
        )
        .await
    }

    /// The signing account's request for `period`; claimable once the period has ended
    pub async fn withdrawal_request(&self, period: u64) -> AgentResult<WithdrawalRequest> {
        let account = self.ctx.require_account(PROTOCOL, "withdrawal_request")?;
        let amount = self.pending_withdrawal(period, account).await?;
        Ok(WithdrawalRequest {
            amount,
            period,
            eligible_from: Eligibility::Period(period.saturating_add(1)),
        })
    }
}

impl ProtocolConnector for Firelight {
    fn protocol(&self) -> Protocol {
        PROTOCOL
    }

    fn context(&self) -> &ConnectorContext {
        &self.ctx
    }

    fn encode(&self, request: &Request) -> AgentResult<Operation> {
        match request {
            Request::Stake { amount } => {
                let account = self.ctx.require_account(PROTOCOL, "stake")?;
                self.encode_stake(*amount, account)
            }
            Request::RequestWithdrawal { amount } => {
                let account = self.ctx.require_account(PROTOCOL, "request_withdrawal")?;
                self.encode_request_withdrawal(*amount, account)
            }
            Request::ClaimWithdrawal { id } => self.encode_claim_withdrawal(*id),
            other => Err(unsupported(PROTOCOL, other)),
        }
    }
}
