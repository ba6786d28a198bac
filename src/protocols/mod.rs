//! Protocol connectors
//!
//! Each connector turns protocol calls into [`Operation`]s for the execution
//! engine and decodes read-only calls made straight against the endpoint.
//! Contract addresses resolve per call, so a connector with a missing address
//! still builds and fails only the operations that need it.

pub mod abi;
pub mod cyclo;
pub mod firelight;
pub mod kinetic;
pub mod sceptre;
pub mod sparkdex;
pub mod stargate;

pub use cyclo::Cyclo;
pub use firelight::Firelight;
pub use kinetic::Kinetic;
pub use sceptre::Sceptre;
pub use sparkdex::{ExactInputSingle, ExactOutputSingle, SparkDex};
pub use stargate::Stargate;

use crate::chain::NetworkEndpoint;
use crate::config::NetworkContracts;
use crate::error::{AgentError, AgentResult};
use crate::math::ReceiptId;
use crate::operation::{Operation, Protocol};
use crate::tx::classify::classify;
use crate::tx::engine::{Execution, ExecutionEngine};

use chrono::{DateTime, Utc};
use ethers::abi::Token;
use ethers::types::{Address, Bytes, TransactionRequest, U256};
use std::sync::Arc;
use tracing::debug;

/// Everything a connector needs: the endpoint for reads, the engine for writes
#[derive(Clone)]
pub struct ConnectorContext {
    pub endpoint: Arc<dyn NetworkEndpoint>,
    pub engine: Option<Arc<ExecutionEngine>>,
    pub contracts: NetworkContracts,
}

impl ConnectorContext {
    /// Context without a signing account; writes fail with a configuration error
    pub fn read_only(endpoint: Arc<dyn NetworkEndpoint>, contracts: NetworkContracts) -> Self {
        Self {
            endpoint,
            engine: None,
            contracts,
        }
    }

    pub fn with_engine(mut self, engine: Arc<ExecutionEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Signing engine, or a configuration error naming the operation
    pub fn engine(&self, protocol: Protocol, operation: &'static str) -> AgentResult<&ExecutionEngine> {
        self.engine.as_deref().ok_or_else(|| {
            AgentError::configuration(protocol, operation, "no signing account configured")
        })
    }

    /// Signing account, if any
    pub fn account(&self) -> Option<Address> {
        self.engine.as_ref().map(|engine| engine.account())
    }

    /// Account for `operation`; required by reads and checks that are per-account
    pub fn require_account(&self, protocol: Protocol, operation: &'static str) -> AgentResult<Address> {
        Ok(self.engine(protocol, operation)?.account())
    }

    /// Read-only call against the latest block
    pub async fn read(
        &self,
        protocol: Protocol,
        operation: &'static str,
        to: Address,
        calldata: Bytes,
    ) -> AgentResult<Bytes> {
        let mut request = TransactionRequest::new().to(to).data(calldata);
        if let Some(from) = self.account() {
            request = request.from(from);
        }
        self.endpoint
            .call(&request.into(), None)
            .await
            .map_err(|raw| AgentError::new(protocol, operation, classify(&raw)))
    }

    /// Time of the latest block; eligibility is judged by the chain, not the local clock
    pub async fn chain_time(&self, protocol: Protocol, operation: &'static str) -> AgentResult<DateTime<Utc>> {
        let timestamp = self
            .endpoint
            .block_timestamp()
            .await
            .map_err(|raw| AgentError::new(protocol, operation, classify(&raw)))?;
        i64::try_from(timestamp)
            .ok()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .ok_or_else(|| {
                AgentError::configuration(protocol, operation, "block timestamp out of range")
            })
    }

    /// Hand a write to the engine
    pub async fn execute(&self, operation: Operation) -> AgentResult<Execution> {
        let engine = self.engine(operation.protocol, operation.label)?;
        engine.execute(operation).await
    }
}

/// Configured address, or a configuration error naming the missing contract
pub fn require(
    address: Option<Address>,
    protocol: Protocol,
    operation: &'static str,
    contract: &str,
) -> AgentResult<Address> {
    address.ok_or_else(|| {
        AgentError::configuration(
            protocol,
            operation,
            format!("{} contract address not configured", contract),
        )
    })
}

/// Decode return data, attributing failures to the calling operation
pub(crate) fn decoded<T>(
    protocol: Protocol,
    operation: &'static str,
    result: Result<T, crate::error::ErrorKind>,
) -> AgentResult<T> {
    result.map_err(|kind| AgentError::new(protocol, operation, kind))
}

/// Refuse to submit when `spender` may not move `amount` of `token` for `owner`.
/// A missing approval would only revert on-chain after paying gas.
pub async fn ensure_allowance(
    ctx: &ConnectorContext,
    protocol: Protocol,
    operation: &'static str,
    token: Address,
    owner: Address,
    spender: Address,
    amount: U256,
) -> AgentResult<()> {
    let calldata = abi::encode_call(
        "allowance(address,address)",
        &[Token::Address(owner), Token::Address(spender)],
    );
    let output = ctx.read(protocol, operation, token, calldata).await?;
    let allowance = decoded(protocol, operation, abi::decode_uint(&output))?;
    debug!(
        "Allowance of {:?} for {:?} on {:?}: {} (need {})",
        owner, spender, token, allowance, amount
    );
    if allowance < amount {
        return Err(AgentError::configuration(
            protocol,
            operation,
            format!(
                "insufficient allowance: {:?} may spend {} of {:?}, need {}",
                spender, allowance, token, amount
            ),
        ));
    }
    Ok(())
}

/// Protocol-neutral write request, encoded by the connector that supports it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Stake { amount: U256 },
    RequestWithdrawal { amount: U256 },
    /// Sceptre unlock request index or Firelight period
    ClaimWithdrawal { id: u64 },
    Supply { amount: U256 },
    Redeem { amount: U256 },
    Lock {
        assets: U256,
        recipient: Address,
        min_share_ratio: U256,
    },
    Unlock {
        shares: U256,
        recipient: Address,
        owner: Address,
        receipt_id: ReceiptId,
    },
    SwapExactIn(ExactInputSingle),
    SwapExactOut(ExactOutputSingle),
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::Stake { .. } => "stake",
            Request::RequestWithdrawal { .. } => "request_withdrawal",
            Request::ClaimWithdrawal { .. } => "claim_withdrawal",
            Request::Supply { .. } => "supply",
            Request::Redeem { .. } => "redeem",
            Request::Lock { .. } => "lock",
            Request::Unlock { .. } => "unlock",
            Request::SwapExactIn(_) => "swap_exact_input_single",
            Request::SwapExactOut(_) => "swap_exact_output_single",
        }
    }
}

/// Common surface of every connector
pub trait ProtocolConnector: Send + Sync {
    fn protocol(&self) -> Protocol;

    fn context(&self) -> &ConnectorContext;

    /// Whether writes can be submitted
    fn can_sign(&self) -> bool {
        self.context().engine.is_some()
    }

    /// Calldata and metadata for `request`, without submitting it
    fn encode(&self, request: &Request) -> AgentResult<Operation> {
        Err(unsupported(self.protocol(), request))
    }
}

pub(crate) fn unsupported(protocol: Protocol, request: &Request) -> AgentError {
    AgentError::configuration(
        protocol,
        request.name(),
        format!("{} does not support {}", protocol, request.name()),
    )
}

/// Any of the supported connectors
pub enum Connector {
    Sceptre(Sceptre),
    Cyclo(Cyclo),
    Kinetic(Kinetic),
    Firelight(Firelight),
    SparkDex(SparkDex),
    Stargate(Stargate),
}

impl Connector {
    pub fn build(protocol: Protocol, ctx: ConnectorContext) -> Self {
        match protocol {
            Protocol::Sceptre => Connector::Sceptre(Sceptre::new(ctx)),
            Protocol::Cyclo => Connector::Cyclo(Cyclo::new(ctx)),
            Protocol::Kinetic => Connector::Kinetic(Kinetic::new(ctx)),
            Protocol::Firelight => Connector::Firelight(Firelight::new(ctx)),
            Protocol::SparkDex => Connector::SparkDex(SparkDex::new(ctx)),
            Protocol::Stargate => Connector::Stargate(Stargate::new(ctx)),
        }
    }

    /// One connector per supported protocol, sharing `ctx`
    pub fn build_all(ctx: &ConnectorContext) -> Vec<Connector> {
        Protocol::ALL
            .iter()
            .map(|protocol| Connector::build(*protocol, ctx.clone()))
            .collect()
    }

    fn inner(&self) -> &dyn ProtocolConnector {
        match self {
            Connector::Sceptre(c) => c,
            Connector::Cyclo(c) => c,
            Connector::Kinetic(c) => c,
            Connector::Firelight(c) => c,
            Connector::SparkDex(c) => c,
            Connector::Stargate(c) => c,
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.inner().protocol()
    }

    pub fn can_sign(&self) -> bool {
        self.inner().can_sign()
    }

    pub fn encode(&self, request: &Request) -> AgentResult<Operation> {
        self.inner().encode(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::testing::{signing_context, test_address, uint_output, FakeEndpoint};

    #[test]
    fn test_build_covers_every_protocol() {
        let ctx = ConnectorContext::read_only(FakeEndpoint::new(14), NetworkContracts::default());
        let connectors = Connector::build_all(&ctx);
        let protocols: Vec<Protocol> = connectors.iter().map(Connector::protocol).collect();
        assert_eq!(protocols, Protocol::ALL.to_vec());
        assert!(connectors.iter().all(|c| !c.can_sign()));
    }

    #[test]
    fn test_missing_engine_is_configuration_error() {
        let ctx = ConnectorContext::read_only(FakeEndpoint::new(14), NetworkContracts::default());
        let err = ctx.engine(Protocol::Kinetic, "supply").err().unwrap();
        assert_eq!(err.kind, ErrorKind::configuration("no signing account configured"));
        assert_eq!(err.operation, "supply");
        assert!(!err.fees_spent());
    }

    #[test]
    fn test_missing_address_names_contract() {
        let err = require(None, Protocol::Sceptre, "stake", "sFLR").unwrap_err();
        assert!(err.to_string().contains("sFLR contract address not configured"));
    }

    #[test]
    fn test_connectors_encode_the_requests_they_support() {
        let ctx = signing_context(FakeEndpoint::new(14));
        let stake = Request::Stake {
            amount: U256::exp10(18),
        };

        let operation = Connector::build(Protocol::Sceptre, ctx.clone()).encode(&stake).unwrap();
        assert_eq!(operation.protocol, Protocol::Sceptre);
        assert_eq!(operation.label, "stake");
        assert_eq!(operation.value, U256::exp10(18));
        assert_eq!(operation.calldata.to_vec(), abi::selector("submit()").to_vec());

        // Firelight deposits on behalf of the signing account
        let operation = Connector::build(Protocol::Firelight, ctx.clone()).encode(&stake).unwrap();
        assert_eq!(operation.to, ctx.contracts.firelight_stxrp_vault.unwrap());
        assert_eq!(&operation.calldata[..4], &abi::selector("deposit(uint256,address)"));
        assert_eq!(Address::from_slice(&operation.calldata[48..68]), test_address());

        let redeem = Request::Redeem { amount: U256::from(7) };
        let operation = Connector::build(Protocol::Kinetic, ctx.clone()).encode(&redeem).unwrap();
        assert_eq!(operation.label, "redeem");
        assert_eq!(operation.to, ctx.contracts.kinetic_ksflr.unwrap());
    }

    #[test]
    fn test_unsupported_request_is_configuration_error() {
        let ctx = signing_context(FakeEndpoint::new(14));
        let stake = Request::Stake { amount: U256::one() };

        for protocol in [Protocol::Kinetic, Protocol::SparkDex, Protocol::Stargate] {
            let err = Connector::build(protocol, ctx.clone()).encode(&stake).unwrap_err();
            assert!(matches!(err.kind, ErrorKind::Configuration { .. }));
            assert_eq!(err.protocol, protocol);
            assert_eq!(err.operation, "stake");
            assert!(err.to_string().contains("does not support stake"));
        }
    }

    #[test]
    fn test_account_bound_request_needs_signer() {
        let ctx = ConnectorContext::read_only(FakeEndpoint::new(14), NetworkContracts::flare_mainnet());
        let stake = Request::Stake { amount: U256::one() };

        assert!(Connector::build(Protocol::Sceptre, ctx.clone()).encode(&stake).is_ok());
        let err = Connector::build(Protocol::Firelight, ctx).encode(&stake).unwrap_err();
        assert_eq!(err.kind, ErrorKind::configuration("no signing account configured"));
    }

    #[tokio::test]
    async fn test_allowance_shortfall_blocks_submission() {
        let endpoint = FakeEndpoint::new(14);
        endpoint.respond(
            abi::selector("allowance(address,address)"),
            uint_output(U256::from(5)),
        );
        let ctx = signing_context(endpoint.clone());
        let token = Address::repeat_byte(0x01);
        let spender = Address::repeat_byte(0x02);

        ensure_allowance(&ctx, Protocol::Kinetic, "supply", token, test_address(), spender, U256::from(5))
            .await
            .unwrap();
        let err = ensure_allowance(&ctx, Protocol::Kinetic, "supply", token, test_address(), spender, U256::from(6))
            .await
            .unwrap_err();
        assert!(matches!(err.kind, ErrorKind::Configuration { .. }));
        assert!(endpoint.sent().is_empty());
    }
}
