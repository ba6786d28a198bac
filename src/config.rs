//! Configuration management for the agent kit
//!
//! Loads configuration from TOML files with environment variable substitution.
//! Every execution constant has a default; network and contracts are explicit
//! so mainnet and testnet environments can coexist in one process.

use anyhow::{Context, Result};
use ethers::types::Address;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

lazy_static! {
    static ref ENV_VAR: Regex = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub network: NetworkConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub wallet: WalletConfig,
    #[serde(default)]
    pub contracts: Contracts,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    pub chain_id: u64,
    #[serde(default = "default_network_name")]
    pub name: String,
    pub rpc_urls: Vec<String>,
    #[serde(default)]
    pub is_testnet: bool,
    #[serde(default)]
    pub gas_price_strategy: GasPriceStrategy,
    #[serde(default = "default_max_gas_price_gwei")]
    pub max_gas_price_gwei: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum GasPriceStrategy {
    Legacy,
    #[default]
    Eip1559,
}

/// Retry, polling and gas policy of the execution pipeline
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub max_submit_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Extra random delay as a fraction of the backoff, 0..=1
    pub retry_jitter: f64,
    pub nonce_conflict_retries: u32,
    pub gas_limit_buffer_percent: u64,
    pub gas_fallback_multiplier_percent: u64,
    pub gas_price_buffer_percent: u64,
    /// Bound on a single send request
    pub submit_timeout_secs: u64,
    pub receipt_poll_interval_ms: u64,
    pub receipt_timeout_secs: u64,
    pub confirmations: u64,
    pub operation_timeout_secs: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_submit_attempts: 5,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 8_000,
            retry_jitter: 0.2,
            nonce_conflict_retries: 2,
            gas_limit_buffer_percent: 20,
            gas_fallback_multiplier_percent: 150,
            gas_price_buffer_percent: 10,
            submit_timeout_secs: 30,
            receipt_poll_interval_ms: 1_500,
            receipt_timeout_secs: 120,
            confirmations: 1,
            operation_timeout_secs: 300,
        }
    }
}

impl ExecutionConfig {
    pub fn receipt_poll_interval(&self) -> Duration {
        Duration::from_millis(self.receipt_poll_interval_ms)
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_secs(self.submit_timeout_secs)
    }

    pub fn receipt_timeout(&self) -> Duration {
        Duration::from_secs(self.receipt_timeout_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WalletConfig {
    /// Name of the environment variable holding the hex private key
    pub private_key_env: Option<String>,
}

/// Contract addresses on each supported network
#[derive(Debug, Clone, Deserialize)]
pub struct Contracts {
    #[serde(default = "NetworkContracts::flare_mainnet")]
    pub flare: NetworkContracts,
    #[serde(default)]
    pub coston2: NetworkContracts,
}

impl Default for Contracts {
    fn default() -> Self {
        Self {
            flare: NetworkContracts::flare_mainnet(),
            coston2: NetworkContracts::default(),
        }
    }
}

/// Contract addresses for a single network
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct NetworkContracts {
    pub sparkdex_swap_router: Option<Address>,
    pub kinetic_ksflr: Option<Address>,
    pub sceptre_sflr: Option<Address>,
    pub cyclo_cysflr_vault: Option<Address>,
    pub cyclo_cysflr_receipt: Option<Address>,
    pub firelight_stxrp_vault: Option<Address>,
    pub stargate_token_messaging: Option<Address>,
    pub stargate_treasurer: Option<Address>,
    pub stargate_eth_oft: Option<Address>,
    pub stargate_usdc_oft: Option<Address>,
    pub stargate_usdt_oft: Option<Address>,
}

impl NetworkContracts {
    /// Published Flare mainnet deployments
    pub fn flare_mainnet() -> Self {
        Self {
            sparkdex_swap_router: parse_address("0x8a1E35F5c98C4E85B36B7B253222eE17773b2781"),
            kinetic_ksflr: parse_address("0x291487beC339c2fE5D83DD45F0a15EFC9Ac45656"),
            sceptre_sflr: parse_address("0x12e605bc104e93B45e1aD99F9e555f659051c2BB"),
            cyclo_cysflr_vault: parse_address("0x19831cfB53A0dbeAD9866C43557C1D48DfF76567"),
            cyclo_cysflr_receipt: parse_address("0xd387FC43E19a63036d8FCeD559E81f5dDeF7ef09"),
            firelight_stxrp_vault: parse_address("0x4C18Ff3C89632c3Dd62E796c0aFA5c07c4c1B2b3"),
            stargate_token_messaging: parse_address("0x45d417612e177672958dC0537C45a8f8d754Ac2E"),
            stargate_treasurer: parse_address("0x090194F1EEDc134A680e3b488aBB2D212dba8c01"),
            stargate_eth_oft: parse_address("0x8e8539e4CcD69123c623a106773F2b0cbbc58746"),
            stargate_usdc_oft: parse_address("0x77C71633C34C3784ede189d74223122422492a0f"),
            stargate_usdt_oft: parse_address("0x1C10CC06DC6D35970d1D53B2A23c76ef370d4135"),
        }
    }
}

fn parse_address(s: &str) -> Option<Address> {
    s.parse().ok()
}

fn default_network_name() -> String {
    "flare".to_string()
}

fn default_max_gas_price_gwei() -> u64 {
    5_000
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

impl Settings {
    /// Load settings from the file named by `FLARE_AGENT_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var("FLARE_AGENT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));
        Self::load_from(&config_path)
    }

    /// Load settings from a specific file
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;
        Self::from_toml_str(&config_str)
    }

    /// Parse settings from TOML text, substituting `${VAR}` references first
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config_str = substitute_env_vars(input);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.network.rpc_urls.is_empty() {
            anyhow::bail!("Network {} has no RPC URLs configured", self.network.name);
        }
        if self.execution.max_submit_attempts == 0 {
            anyhow::bail!("execution.max_submit_attempts must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.execution.retry_jitter) {
            anyhow::bail!("execution.retry_jitter must be within 0..=1");
        }
        if self.execution.gas_fallback_multiplier_percent < 100 {
            anyhow::bail!("execution.gas_fallback_multiplier_percent must be at least 100");
        }
        if self.wallet.private_key_env.is_none() {
            tracing::warn!("No wallet configured - connectors will be read-only");
        }

        Ok(())
    }

    /// Contract addresses of the active network
    pub fn contracts(&self) -> &NetworkContracts {
        if self.network.is_testnet {
            &self.contracts.coston2
        } else {
            &self.contracts.flare
        }
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();

    for cap in ENV_VAR.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
