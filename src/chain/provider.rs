//! Chain provider with multi-RPC support and automatic failover

use super::{GasPrice, NetworkEndpoint, RawFailure, Receipt};
use crate::config::{GasPriceStrategy, NetworkConfig};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Default priority fee when the node gives no better signal (2 gwei)
const DEFAULT_PRIORITY_FEE_WEI: u64 = 2_000_000_000;

/// Multi-provider wrapper with automatic failover
pub struct ChainProvider {
    /// Network configuration
    config: NetworkConfig,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
}

impl ChainProvider {
    /// Create a new chain provider without touching the network
    pub fn new(config: NetworkConfig) -> Result<Self, RawFailure> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    http_providers.push(provider);
                    debug!("Added HTTP provider for chain {}: {}", config.chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(RawFailure::Configuration(format!(
                "No valid RPC providers for chain {}",
                config.chain_id
            )));
        }

        Ok(Self {
            config,
            http_providers,
            current_provider: AtomicUsize::new(0),
        })
    }

    /// Create a provider and verify the endpoint serves the configured chain
    pub async fn connect(config: NetworkConfig) -> Result<Self, RawFailure> {
        let provider = Self::new(config)?;

        let mut last_error = None;
        for _ in 0..provider.http_providers.len() {
            match provider.http().get_chainid().await {
                Ok(remote) if remote.as_u64() == provider.config.chain_id => {
                    info!(
                        "Connected to {} (chain {})",
                        provider.config.name, provider.config.chain_id
                    );
                    return Ok(provider);
                }
                Ok(remote) => {
                    return Err(RawFailure::Configuration(format!(
                        "Endpoint serves chain {}, expected {}",
                        remote, provider.config.chain_id
                    )));
                }
                Err(e) => last_error = Some(provider.convert(e)),
            }
        }

        Err(last_error.unwrap_or_else(|| RawFailure::Transport("All providers failed".to_string())))
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        if self.http_providers.len() < 2 {
            return;
        }
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.config.chain_id, next);
    }

    /// Convert a provider error, rotating endpoints on transport failures
    fn convert(&self, err: ProviderError) -> RawFailure {
        let raw = RawFailure::from(err);
        if raw.is_transport() {
            self.failover();
        }
        raw
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.config.request_timeout_ms)
    }

    /// Estimate EIP-1559 fees
    async fn estimate_eip1559_fees(&self) -> Result<(U256, U256), RawFailure> {
        let block = self
            .http()
            .get_block(BlockNumber::Latest)
            .await
            .map_err(|e| self.convert(e))?
            .ok_or_else(|| RawFailure::Transport("No latest block".to_string()))?;

        let base_fee = block
            .base_fee_per_gas
            .ok_or_else(|| RawFailure::Configuration("No base fee in block".to_string()))?;

        let priority_fee = U256::from(DEFAULT_PRIORITY_FEE_WEI);

        // Max fee = 2 * base_fee + priority_fee (buffer for block variability)
        let max_fee = base_fee * 2 + priority_fee;

        // Cap at configured max
        let max_wei = U256::from(self.config.max_gas_price_gwei) * U256::exp10(9);
        let max_fee = std::cmp::min(max_fee, max_wei);

        Ok((max_fee, std::cmp::min(priority_fee, max_fee)))
    }

    /// Health check
    pub async fn health_check(&self) -> bool {
        match self.block_number().await {
            Ok(_) => true,
            Err(e) => {
                error!("Health check failed for chain {}: {}", self.config.chain_id, e);
                false
            }
        }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }
}

#[async_trait]
impl NetworkEndpoint for ChainProvider {
    fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    /// Get current block number with failover
    async fn block_number(&self) -> Result<u64, RawFailure> {
        let mut last_error = None;
        for _ in 0..self.http_providers.len() {
            match self.http().get_block_number().await {
                Ok(block) => return Ok(block.as_u64()),
                Err(e) => {
                    warn!(
                        "Failed to get block number from chain {}: {}",
                        self.config.chain_id, e
                    );
                    let raw = self.convert(e);
                    if !raw.is_transport() {
                        return Err(raw);
                    }
                    last_error = Some(raw);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| RawFailure::Transport("All providers failed".to_string())))
    }

    async fn block_timestamp(&self) -> Result<u64, RawFailure> {
        let block = self
            .http()
            .get_block(BlockNumber::Latest)
            .await
            .map_err(|e| self.convert(e))?
            .ok_or_else(|| RawFailure::Transport("No latest block".to_string()))?;
        Ok(block.timestamp.low_u64())
    }

    async fn call(&self, tx: &TypedTransaction, block: Option<u64>) -> Result<Bytes, RawFailure> {
        let block = block.map(|b| BlockId::Number(BlockNumber::Number(b.into())));
        let mut last_error = None;
        for _ in 0..self.http_providers.len() {
            match self.http().call(tx, block).await {
                Ok(output) => return Ok(output),
                Err(e) => {
                    let raw = self.convert(e);
                    if !raw.is_transport() {
                        return Err(raw);
                    }
                    last_error = Some(raw);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| RawFailure::Transport("All providers failed".to_string())))
    }

    async fn estimate_gas(&self, tx: &TypedTransaction) -> Result<U256, RawFailure> {
        self.http()
            .estimate_gas(tx, None)
            .await
            .map_err(|e| self.convert(e))
    }

    /// Get current gas price based on configured strategy
    async fn gas_price(&self) -> Result<GasPrice, RawFailure> {
        match self.config.gas_price_strategy {
            GasPriceStrategy::Legacy => {
                let price = self
                    .http()
                    .get_gas_price()
                    .await
                    .map_err(|e| self.convert(e))?;
                Ok(GasPrice::Legacy(price))
            }
            GasPriceStrategy::Eip1559 => {
                let (max_fee, priority_fee) = self.estimate_eip1559_fees().await?;
                Ok(GasPrice::Eip1559 {
                    max_fee_per_gas: max_fee,
                    max_priority_fee_per_gas: priority_fee,
                })
            }
        }
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, RawFailure> {
        match timeout(self.request_timeout(), self.http().send_raw_transaction(raw)).await {
            Ok(Ok(pending_tx)) => Ok(pending_tx.tx_hash()),
            Ok(Err(e)) => Err(self.convert(e)),
            Err(_) => {
                self.failover();
                Err(RawFailure::Transport("send_raw_transaction timed out".to_string()))
            }
        }
    }

    async fn transaction_receipt(&self, tx_hash: H256) -> Result<Option<Receipt>, RawFailure> {
        self.http()
            .get_transaction_receipt(tx_hash)
            .await
            .map(|receipt| receipt.map(Receipt::from))
            .map_err(|e| self.convert(e))
    }

    async fn transaction_count(&self, address: Address) -> Result<u64, RawFailure> {
        let mut last_error = None;
        for _ in 0..self.http_providers.len() {
            match self
                .http()
                .get_transaction_count(address, Some(BlockNumber::Pending.into()))
                .await
            {
                Ok(count) => return Ok(count.as_u64()),
                Err(e) => {
                    let raw = self.convert(e);
                    if !raw.is_transport() {
                        return Err(raw);
                    }
                    last_error = Some(raw);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| RawFailure::Transport("All providers failed".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network(rpc_urls: Vec<&str>) -> NetworkConfig {
        NetworkConfig {
            chain_id: 14,
            name: "flare".to_string(),
            rpc_urls: rpc_urls.into_iter().map(String::from).collect(),
            is_testnet: false,
            gas_price_strategy: GasPriceStrategy::Eip1559,
            max_gas_price_gwei: 5_000,
            request_timeout_ms: 1_000,
        }
    }

    #[test]
    fn test_rejects_config_without_valid_urls() {
        let result = ChainProvider::new(network(vec!["not a url"]));
        assert!(matches!(result, Err(RawFailure::Configuration(_))));
    }

    #[test]
    fn test_failover_rotates_providers() {
        let provider = ChainProvider::new(network(vec![
            "http://127.0.0.1:9650/ext/C/rpc",
            "http://127.0.0.1:9651/ext/C/rpc",
        ]))
        .unwrap();
        assert_eq!(provider.current_provider.load(Ordering::Relaxed), 0);
        provider.failover();
        assert_eq!(provider.current_provider.load(Ordering::Relaxed), 1);
        provider.failover();
        assert_eq!(provider.current_provider.load(Ordering::Relaxed), 0);
        assert_eq!(provider.chain_id(), 14);
    }
}
