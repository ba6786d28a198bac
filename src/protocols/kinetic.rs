//! Kinetic lending market (sFLR ⇄ ksFLR)

use super::{
    abi, decoded, ensure_allowance, require, unsupported, ConnectorContext, ProtocolConnector, Request,
};
use crate::error::{AgentError, AgentResult};
use crate::math::ExchangeRate;
use crate::operation::{Operation, OperationKind, Protocol};
use crate::tx::engine::Execution;

use ethers::abi::Token;
use ethers::types::{Address, U256};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const PROTOCOL: Protocol = Protocol::Kinetic;

pub struct Kinetic {
    ctx: ConnectorContext,
    /// Last observed `exchangeRateStored` mantissa
    last_rate: Mutex<Option<ExchangeRate>>,
}

impl Kinetic {
    pub fn new(ctx: ConnectorContext) -> Self {
        Self {
            ctx,
            last_rate: Mutex::new(None),
        }
    }

    fn market(&self, operation: &'static str) -> AgentResult<Address> {
        require(self.ctx.contracts.kinetic_ksflr, PROTOCOL, operation, "Kinetic ksFLR")
    }

    async fn read_uint(&self, operation: &'static str, signature: &str, args: &[Token]) -> AgentResult<U256> {
        let to = self.market(operation)?;
        let output = self
            .ctx
            .read(PROTOCOL, operation, to, abi::encode_call(signature, args))
            .await?;
        decoded(PROTOCOL, operation, abi::decode_uint(&output))
    }

    pub fn encode_supply(&self, amount: U256) -> AgentResult<Operation> {
        let to = self.market("supply")?;
        Ok(Operation::new(
            PROTOCOL,
            OperationKind::Supply,
            "supply",
            to,
            abi::encode_call("mint(uint256)", &[Token::Uint(amount)]),
        ))
    }

    pub fn encode_redeem(&self, ctokens: U256) -> AgentResult<Operation> {
        let to = self.market("redeem")?;
        Ok(Operation::new(
            PROTOCOL,
            OperationKind::Redeem,
            "redeem",
            to,
            abi::encode_call("redeem(uint256)", &[Token::Uint(ctokens)]),
        ))
    }

    /// Supply `amount` of the underlying for ksFLR
    pub async fn supply(&self, amount: U256) -> AgentResult<Execution> {
        let operation = self.encode_supply(amount)?;
        let account = self.ctx.require_account(PROTOCOL, "supply")?;
        let underlying = self.underlying("supply").await?;
        ensure_allowance(&self.ctx, PROTOCOL, "supply", underlying, account, operation.to, amount)
            .await?;

        info!("Supplying {} to Kinetic", amount);
        self.ctx.execute(operation).await
    }

    /// Redeem `ctokens` ksFLR for the underlying
    pub async fn redeem(&self, ctokens: U256) -> AgentResult<Execution> {
        info!("Redeeming {} ksFLR from Kinetic", ctokens);
        self.ctx.execute(self.encode_redeem(ctokens)?).await
    }

    async fn underlying(&self, operation: &'static str) -> AgentResult<Address> {
        let to = self.market(operation)?;
        let output = self
            .ctx
            .read(PROTOCOL, operation, to, abi::encode_call("underlying()", &[]))
            .await?;
        decoded(PROTOCOL, operation, abi::decode_address(&output))
    }

    /// ksFLR balance
    pub async fn balance_of(&self, owner: Address) -> AgentResult<U256> {
        self.read_uint("balance_of", "balanceOf(address)", &[Token::Address(owner)])
            .await
    }

    /// Underlying value of `owner`'s ksFLR at the stored rate, floored
    pub async fn underlying_balance(&self, owner: Address) -> AgentResult<U256> {
        let balance = self.balance_of(owner).await?;
        let rate = self.exchange_rate().await?;
        rate.assets_for_shares(balance)
            .map_err(|e| AgentError::configuration(PROTOCOL, "underlying_balance", e.to_string()))
    }

    /// Stored exchange rate; a drop from the previous observation is logged
    pub async fn exchange_rate(&self) -> AgentResult<ExchangeRate> {
        let mantissa = self
            .read_uint("exchange_rate", "exchangeRateStored()", &[])
            .await?;
        let rate = ExchangeRate::from_mantissa(mantissa);

        let mut last = self.last_rate.lock().await;
        if let Some(previous) = last.as_ref() {
            if !rate.is_not_below(previous) {
                warn!(
                    "Kinetic exchange rate decreased from {} to {}",
                    previous.total_assets(),
                    mantissa
                );
            }
        }
        debug!("Kinetic exchange rate mantissa: {}", mantissa);
        *last = Some(rate);
        Ok(rate)
    }

    pub async fn supply_rate_per_timestamp(&self) -> AgentResult<U256> {
        self.read_uint("supply_rate_per_timestamp", "supplyRatePerTimestamp()", &[])
            .await
    }
}

impl ProtocolConnector for Kinetic {
    fn protocol(&self) -> Protocol {
        PROTOCOL
    }

    fn context(&self) -> &ConnectorContext {
        &self.ctx
    }

    fn encode(&self, request: &Request) -> AgentResult<Operation> {
        match request {
            Request::Supply { amount } => self.encode_supply(*amount),
            Request::Redeem { amount } => self.encode_redeem(*amount),
            other => Err(unsupported(PROTOCOL, other)),
        }
    }
}
