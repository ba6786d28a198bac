//! SparkDEX V3 swap router (single-pool swaps)

use super::{
    abi, decoded, ensure_allowance, require, unsupported, ConnectorContext, ProtocolConnector, Request,
};
use crate::error::{AgentError, AgentResult};
use crate::operation::{Bound, Operation, OperationKind, Protocol};
use crate::tx::engine::Execution;

use chrono::Utc;
use ethers::abi::Token;
use ethers::types::{Address, U256};
use tracing::info;

const PROTOCOL: Protocol = Protocol::SparkDex;

const EXACT_INPUT_SINGLE: &str =
    "exactInputSingle((address,address,uint24,address,uint256,uint256,uint256,uint160))";
const EXACT_OUTPUT_SINGLE: &str =
    "exactOutputSingle((address,address,uint24,address,uint256,uint256,uint256,uint160))";

/// Pool fee tier in hundredths of a basis point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeeTier {
    /// 0.05%
    Low,
    /// 0.3%
    Medium,
    /// 1%
    High,
}

impl FeeTier {
    pub fn fee(&self) -> u32 {
        match self {
            FeeTier::Low => 500,
            FeeTier::Medium => 3_000,
            FeeTier::High => 10_000,
        }
    }

    pub fn from_fee(fee: u32) -> Option<Self> {
        match fee {
            500 => Some(FeeTier::Low),
            3_000 => Some(FeeTier::Medium),
            10_000 => Some(FeeTier::High),
            _ => None,
        }
    }
}

/// Swap exactly `amount_in` of `token_in` for at least `amount_out_minimum`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExactInputSingle {
    pub token_in: Address,
    pub token_out: Address,
    pub fee: FeeTier,
    pub recipient: Address,
    /// Unix seconds after which the router rejects the swap
    pub deadline: u64,
    pub amount_in: U256,
    pub amount_out_minimum: U256,
    /// Zero for no price limit
    pub sqrt_price_limit_x96: U256,
}

/// Swap at most `amount_in_maximum` of `token_in` for exactly `amount_out`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExactOutputSingle {
    pub token_in: Address,
    pub token_out: Address,
    pub fee: FeeTier,
    pub recipient: Address,
    pub deadline: u64,
    pub amount_out: U256,
    pub amount_in_maximum: U256,
    pub sqrt_price_limit_x96: U256,
}

pub struct SparkDex {
    ctx: ConnectorContext,
}

impl SparkDex {
    pub fn new(ctx: ConnectorContext) -> Self {
        Self { ctx }
    }

    fn router(&self, operation: &'static str) -> AgentResult<Address> {
        require(self.ctx.contracts.sparkdex_swap_router, PROTOCOL, operation, "SparkDEX swap router")
    }

    pub fn encode_exact_input_single(&self, params: &ExactInputSingle) -> AgentResult<Operation> {
        let to = self.router("swap_exact_input_single")?;
        let tuple = Token::Tuple(vec![
            Token::Address(params.token_in),
            Token::Address(params.token_out),
            Token::Uint(params.fee.fee().into()),
            Token::Address(params.recipient),
            Token::Uint(params.deadline.into()),
            Token::Uint(params.amount_in),
            Token::Uint(params.amount_out_minimum),
            Token::Uint(params.sqrt_price_limit_x96),
        ]);
        Ok(Operation::new(
            PROTOCOL,
            OperationKind::SwapExactIn,
            "swap_exact_input_single",
            to,
            abi::encode_call(EXACT_INPUT_SINGLE, &[tuple]),
        )
        .with_bound(Bound::MinOut(params.amount_out_minimum)))
    }

    pub fn encode_exact_output_single(&self, params: &ExactOutputSingle) -> AgentResult<Operation> {
        let to = self.router("swap_exact_output_single")?;
        let tuple = Token::Tuple(vec![
            Token::Address(params.token_in),
            Token::Address(params.token_out),
            Token::Uint(params.fee.fee().into()),
            Token::Address(params.recipient),
            Token::Uint(params.deadline.into()),
            Token::Uint(params.amount_out),
            Token::Uint(params.amount_in_maximum),
            Token::Uint(params.sqrt_price_limit_x96),
        ]);
        Ok(Operation::new(
            PROTOCOL,
            OperationKind::SwapExactOut,
            "swap_exact_output_single",
            to,
            abi::encode_call(EXACT_OUTPUT_SINGLE, &[tuple]),
        )
        .with_bound(Bound::MaxIn(params.amount_in_maximum)))
    }

    pub async fn swap_exact_input_single(&self, params: &ExactInputSingle) -> AgentResult<Execution> {
        const OPERATION: &str = "swap_exact_input_single";
        let operation = self.encode_exact_input_single(params)?;
        ensure_deadline(OPERATION, params.deadline)?;
        let account = self.ctx.require_account(PROTOCOL, OPERATION)?;
        ensure_allowance(
            &self.ctx,
            PROTOCOL,
            OPERATION,
            params.token_in,
            account,
            operation.to,
            params.amount_in,
        )
        .await?;

        info!(
            "Swapping {} of {:?} for at least {} of {:?} (fee {})",
            params.amount_in,
            params.token_in,
            params.amount_out_minimum,
            params.token_out,
            params.fee.fee()
        );
        self.ctx.execute(operation).await
    }

    pub async fn swap_exact_output_single(&self, params: &ExactOutputSingle) -> AgentResult<Execution> {
        const OPERATION: &str = "swap_exact_output_single";
        let operation = self.encode_exact_output_single(params)?;
        ensure_deadline(OPERATION, params.deadline)?;
        let account = self.ctx.require_account(PROTOCOL, OPERATION)?;
        ensure_allowance(
            &self.ctx,
            PROTOCOL,
            OPERATION,
            params.token_in,
            account,
            operation.to,
            params.amount_in_maximum,
        )
        .await?;

        info!(
            "Swapping at most {} of {:?} for {} of {:?} (fee {})",
            params.amount_in_maximum,
            params.token_in,
            params.amount_out,
            params.token_out,
            params.fee.fee()
        );
        self.ctx.execute(operation).await
    }

    pub async fn factory(&self) -> AgentResult<Address> {
        self.read_address("factory", "factory()").await
    }

    /// Wrapped native token (WFLR)
    pub async fn weth9(&self) -> AgentResult<Address> {
        self.read_address("weth9", "WETH9()").await
    }

    async fn read_address(&self, operation: &'static str, signature: &str) -> AgentResult<Address> {
        let to = self.router(operation)?;
        let output = self
            .ctx
            .read(PROTOCOL, operation, to, abi::encode_call(signature, &[]))
            .await?;
        decoded(PROTOCOL, operation, abi::decode_address(&output))
    }
}

impl ProtocolConnector for SparkDex {
    fn protocol(&self) -> Protocol {
        PROTOCOL
    }

    fn context(&self) -> &ConnectorContext {
        &self.ctx
    }

    fn encode(&self, request: &Request) -> AgentResult<Operation> {
        match request {
            Request::SwapExactIn(params) => self.encode_exact_input_single(params),
            Request::SwapExactOut(params) => self.encode_exact_output_single(params),
            other => Err(unsupported(PROTOCOL, other)),
        }
    }
}

/// A swap past its deadline can only revert; refuse it before it takes a nonce
fn ensure_deadline(operation: &'static str, deadline: u64) -> AgentResult<()> {
    let now = Utc::now().timestamp().max(0) as u64;
    if deadline <= now {
        return Err(AgentError::configuration(
            PROTOCOL,
            operation,
            format!("swap deadline {} already passed (now {})", deadline, now),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::math::WAD;
    use crate::testing::{address_output, signing_context, test_address, uint_output, FakeEndpoint};
    use ethers::abi::ParamType;

    fn exact_input(deadline: u64) -> ExactInputSingle {
        ExactInputSingle {
            token_in: Address::repeat_byte(0x01),
            token_out: Address::repeat_byte(0x02),
            fee: FeeTier::Medium,
            recipient: test_address(),
            deadline,
            amount_in: WAD,
            amount_out_minimum: WAD / 2,
            sqrt_price_limit_x96: U256::zero(),
        }
    }

    fn in_an_hour() -> u64 {
        Utc::now().timestamp() as u64 + 3_600
    }

    #[test]
    fn test_fee_tiers() {
        for tier in [FeeTier::Low, FeeTier::Medium, FeeTier::High] {
            assert_eq!(FeeTier::from_fee(tier.fee()), Some(tier));
        }
        assert_eq!(FeeTier::from_fee(100), None);
    }

    #[test]
    fn test_exact_input_encoding_carries_bound() {
        let swap = SparkDex::new(signing_context(FakeEndpoint::new(14)));
        let params = exact_input(1_900_000_000);
        let op = swap.encode_exact_input_single(&params).unwrap();

        assert_eq!(op.bound, Some(Bound::MinOut(WAD / 2)));
        assert_eq!(&op.calldata[..4], &abi::selector(EXACT_INPUT_SINGLE));
        let tokens = ethers::abi::decode(
            &[ParamType::Tuple(vec![
                ParamType::Address,
                ParamType::Address,
                ParamType::Uint(24),
                ParamType::Address,
                ParamType::Uint(256),
                ParamType::Uint(256),
                ParamType::Uint(256),
                ParamType::Uint(160),
            ])],
            &op.calldata[4..],
        )
        .unwrap();
        let fields = tokens[0].clone().into_tuple().unwrap();
        assert_eq!(fields[2], Token::Uint(U256::from(3_000)));
        assert_eq!(fields[4], Token::Uint(U256::from(1_900_000_000u64)));
        assert_eq!(fields[5], Token::Uint(WAD));
    }

    #[tokio::test]
    async fn test_expired_deadline_is_refused_without_nonce() {
        let endpoint = FakeEndpoint::new(14);
        let swap = SparkDex::new(signing_context(endpoint.clone()));

        let err = swap
            .swap_exact_input_single(&exact_input(1_000))
            .await
            .unwrap_err();
        assert!(matches!(err.kind, ErrorKind::Configuration { .. }));
        assert!(endpoint.calls().is_empty());
        assert!(endpoint.sent().is_empty());
    }

    #[tokio::test]
    async fn test_exact_output_swap_submits_with_max_in() {
        let endpoint = FakeEndpoint::new(14);
        endpoint.respond(abi::selector("allowance(address,address)"), uint_output(WAD * 3));
        let swap = SparkDex::new(signing_context(endpoint.clone()));
        let params = ExactOutputSingle {
            token_in: Address::repeat_byte(0x01),
            token_out: Address::repeat_byte(0x02),
            fee: FeeTier::Low,
            recipient: test_address(),
            deadline: in_an_hour(),
            amount_out: WAD,
            amount_in_maximum: WAD * 2,
            sqrt_price_limit_x96: U256::zero(),
        };

        let execution = swap.swap_exact_output_single(&params).await.unwrap();
        assert!(execution.is_confirmed());
        let sent = endpoint.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(&sent[0].data[..4], &abi::selector(EXACT_OUTPUT_SINGLE));
    }

    #[tokio::test]
    async fn test_router_reads() {
        let endpoint = FakeEndpoint::new(14);
        endpoint.respond(abi::selector("factory()"), address_output(Address::repeat_byte(0xfa)));
        endpoint.respond(abi::selector("WETH9()"), address_output(Address::repeat_byte(0x1d)));
        let swap = SparkDex::new(signing_context(endpoint));

        assert_eq!(swap.factory().await.unwrap(), Address::repeat_byte(0xfa));
        assert_eq!(swap.weth9().await.unwrap(), Address::repeat_byte(0x1d));
    }
}
