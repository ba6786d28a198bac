//! Gas estimation with a deterministic fallback policy

use super::classify::classify;
use super::sender::RetryPolicy;
use crate::chain::{GasPrice, NetworkEndpoint};
use crate::config::ExecutionConfig;
use crate::error::ErrorKind;
use crate::operation::Operation;

use ethers::types::{Address, U256};
use tracing::{debug, warn};

/// Where a gas limit came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GasSource {
    Simulated,
    Fallback,
}

/// Gas limit and fee parameters for one submission attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasPlan {
    pub gas_limit: U256,
    pub fees: GasPrice,
    pub source: GasSource,
}

/// Gas estimator for transactions
#[derive(Debug, Clone)]
pub struct GasEstimator {
    /// Buffer percentage for gas limit (e.g., 20 = 20% buffer)
    gas_limit_buffer_percent: u64,
    /// Multiplier applied to the declared ceiling when simulation is unavailable
    fallback_multiplier_percent: u64,
    /// Buffer percentage for gas price
    gas_price_buffer_percent: u64,
    /// Hard cap on the price per gas, in wei
    max_price_per_gas: U256,
}

impl GasEstimator {
    pub fn new(config: &ExecutionConfig, max_gas_price_gwei: u64) -> Self {
        Self {
            gas_limit_buffer_percent: config.gas_limit_buffer_percent,
            fallback_multiplier_percent: config.gas_fallback_multiplier_percent,
            gas_price_buffer_percent: config.gas_price_buffer_percent,
            max_price_per_gas: U256::from(max_gas_price_gwei) * U256::exp10(9),
        }
    }

    /// Gas limit and fresh fees for `operation` sent from `from`.
    /// Fee lookups are retried under `policy`; estimation is not.
    pub async fn estimate(
        &self,
        endpoint: &dyn NetworkEndpoint,
        operation: &Operation,
        from: Address,
        policy: &RetryPolicy,
    ) -> Result<GasPlan, ErrorKind> {
        let (gas_limit, source) = self.gas_limit(endpoint, operation, from).await?;
        let fees = self.fees(endpoint, policy).await?;
        Ok(GasPlan {
            gas_limit,
            fees,
            source,
        })
    }

    /// Same gas limit with fees fetched again, for a re-signed attempt
    pub async fn reprice(
        &self,
        plan: GasPlan,
        endpoint: &dyn NetworkEndpoint,
        policy: &RetryPolicy,
    ) -> Result<GasPlan, ErrorKind> {
        let fees = self.fees(endpoint, policy).await?;
        Ok(GasPlan { fees, ..plan })
    }

    /// Simulated gas plus buffer; the declared ceiling when simulation is unavailable.
    /// A simulated revert is returned as an error.
    pub async fn gas_limit(
        &self,
        endpoint: &dyn NetworkEndpoint,
        operation: &Operation,
        from: Address,
    ) -> Result<(U256, GasSource), ErrorKind> {
        let min_gas = U256::from(operation.kind.min_gas());

        match endpoint.estimate_gas(&operation.to_call(from)).await {
            Ok(estimate) => {
                let buffered = estimate + estimate * self.gas_limit_buffer_percent / 100;
                let gas_limit = std::cmp::max(buffered, min_gas);
                debug!(
                    "Gas for {} {}: estimated {}, using {}",
                    operation.protocol, operation.label, estimate, gas_limit
                );
                Ok((gas_limit, GasSource::Simulated))
            }
            Err(raw) => match classify(&raw) {
                ErrorKind::Transient { .. } => {
                    let gas_limit = self.fallback_gas_limit(operation);
                    warn!(
                        "Gas estimation unavailable for {} {} ({}), falling back to {}",
                        operation.protocol, operation.label, raw, gas_limit
                    );
                    crate::metrics::record_gas_fallback(operation.kind);
                    Ok((gas_limit, GasSource::Fallback))
                }
                kind => Err(kind),
            },
        }
    }

    /// Declared ceiling times the safety multiplier, never below the kind's minimum
    pub fn fallback_gas_limit(&self, operation: &Operation) -> U256 {
        let ceiling = U256::from(operation.kind.default_gas_ceiling());
        let scaled = ceiling * self.fallback_multiplier_percent / 100;
        std::cmp::max(scaled, U256::from(operation.kind.min_gas()))
    }

    /// Fee parameters fetched fresh from the network, buffered and capped
    pub async fn fees(
        &self,
        endpoint: &dyn NetworkEndpoint,
        policy: &RetryPolicy,
    ) -> Result<GasPrice, ErrorKind> {
        let gas_price = policy.retry("fees", || endpoint.gas_price()).await?;
        let buffered = self.adjust(gas_price);
        debug!("Gas price for chain {}: {:?}", endpoint.chain_id(), buffered);
        Ok(buffered)
    }

    /// Apply the price buffer and the configured cap
    pub fn adjust(&self, gas_price: GasPrice) -> GasPrice {
        let cap = self.max_price_per_gas;
        match gas_price {
            GasPrice::Legacy(price) => {
                let buffer = price * self.gas_price_buffer_percent / 100;
                GasPrice::Legacy(std::cmp::min(price + buffer, cap))
            }
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                let fee_buffer = max_fee_per_gas * self.gas_price_buffer_percent / 100;
                let priority_buffer =
                    max_priority_fee_per_gas * self.gas_price_buffer_percent / 100;
                let max_fee = std::cmp::min(max_fee_per_gas + fee_buffer, cap);
                GasPrice::Eip1559 {
                    max_fee_per_gas: max_fee,
                    max_priority_fee_per_gas: std::cmp::min(
                        max_priority_fee_per_gas + priority_buffer,
                        max_fee,
                    ),
                }
            }
        }
    }

    /// Calculate worst-case cost in wei
    pub fn max_cost(gas_limit: U256, gas_price: &GasPrice) -> U256 {
        gas_limit * gas_price.max_per_gas()
    }
}
