//! Stargate bridge metadata for Flare (LayerZero V2 endpoint ids and OFT addresses)

use super::{require, ConnectorContext, ProtocolConnector};
use crate::error::{AgentError, AgentResult};
use crate::operation::Protocol;

use ethers::types::Address;
use serde::Serialize;

const PROTOCOL: Protocol = Protocol::Stargate;

/// LayerZero endpoint id of Flare mainnet
pub const FLARE_ENDPOINT_ID: u32 = 30295;

/// Destination chains reachable from Flare
pub const CHAINS: [(&str, u32); 10] = [
    ("ethereum", 30101),
    ("bnb_chain", 30102),
    ("avalanche", 30106),
    ("polygon", 30109),
    ("arbitrum", 30110),
    ("optimism", 30111),
    ("base", 30184),
    ("linea", 30183),
    ("scroll", 30214),
    ("mantle", 30181),
];

pub const SUPPORTED_TOKENS: [&str; 3] = ["ETH", "USDC", "USDT"];

/// Bridge summary for Flare
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BridgeInfo {
    pub network: &'static str,
    pub endpoint_id: u32,
    pub token_messaging: Option<Address>,
    pub treasurer: Option<Address>,
    pub supported_tokens: Vec<&'static str>,
    pub supported_chains: Vec<&'static str>,
}

pub struct Stargate {
    ctx: ConnectorContext,
}

impl Stargate {
    pub fn new(ctx: ConnectorContext) -> Self {
        Self { ctx }
    }

    /// OFT contract on Flare for `token` (case-insensitive)
    pub fn oft_address(&self, token: &str) -> AgentResult<Address> {
        let contracts = &self.ctx.contracts;
        let (address, name) = match token.to_uppercase().as_str() {
            "ETH" => (contracts.stargate_eth_oft, "Stargate ETH OFT"),
            "USDC" => (contracts.stargate_usdc_oft, "Stargate USDC OFT"),
            "USDT" => (contracts.stargate_usdt_oft, "Stargate USDT OFT"),
            _ => {
                return Err(AgentError::configuration(
                    PROTOCOL,
                    "oft_address",
                    format!(
                        "unsupported token {}; supported: {}",
                        token,
                        SUPPORTED_TOKENS.join(", ")
                    ),
                ))
            }
        };
        require(address, PROTOCOL, "oft_address", name)
    }

    /// LayerZero endpoint id of `chain` (case-insensitive)
    pub fn chain_endpoint(&self, chain: &str) -> AgentResult<u32> {
        let chain = chain.to_lowercase();
        CHAINS
            .iter()
            .find(|(name, _)| *name == chain)
            .map(|(_, id)| *id)
            .ok_or_else(|| {
                AgentError::configuration(
                    PROTOCOL,
                    "chain_endpoint",
                    format!(
                        "unsupported chain {}; supported: {}",
                        chain,
                        self.supported_chains().join(", ")
                    ),
                )
            })
    }

    pub fn supported_tokens(&self) -> Vec<&'static str> {
        SUPPORTED_TOKENS.to_vec()
    }

    pub fn supported_chains(&self) -> Vec<&'static str> {
        CHAINS.iter().map(|(name, _)| *name).collect()
    }

    pub fn bridge_info(&self) -> BridgeInfo {
        BridgeInfo {
            network: "Flare",
            endpoint_id: FLARE_ENDPOINT_ID,
            token_messaging: self.ctx.contracts.stargate_token_messaging,
            treasurer: self.ctx.contracts.stargate_treasurer,
            supported_tokens: self.supported_tokens(),
            supported_chains: self.supported_chains(),
        }
    }
}

impl ProtocolConnector for Stargate {
    fn protocol(&self) -> Protocol {
        PROTOCOL
    }

    fn context(&self) -> &ConnectorContext {
        &self.ctx
    }
}
