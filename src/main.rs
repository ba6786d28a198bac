//! flare-agent - connects to Flare and logs a status snapshot of every connector
//!
//! Configuration comes from `FLARE_AGENT_CONFIG` (default `config/default.toml`).
//! Set `FLARE_AGENT_LOG_FORMAT=json` for JSON log lines.

use anyhow::Result;
use ethers::types::U256;
use ethers::utils::format_units;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};

use flare_agent_kit::chain::{ChainProvider, NetworkEndpoint};
use flare_agent_kit::config::Settings;
use flare_agent_kit::protocols::{Connector, ConnectorContext};
use flare_agent_kit::tx::{load_wallet, ExecutionEngine, TransactionSigner};
use flare_agent_kit::{metrics, telemetry};

#[tokio::main]
async fn main() -> Result<()> {
    let json = std::env::var("FLARE_AGENT_LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    telemetry::init_logging(json);

    info!("Starting flare-agent v{}", env!("CARGO_PKG_VERSION"));

    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} (chain {}, {} RPC URLs)",
        settings.network.name,
        settings.network.chain_id,
        settings.network.rpc_urls.len()
    );

    let provider = Arc::new(ChainProvider::connect(settings.network.clone()).await?);
    let endpoint: Arc<dyn NetworkEndpoint> = provider.clone();

    let mut ctx = ConnectorContext::read_only(endpoint.clone(), settings.contracts().clone());
    if let Some(wallet) = load_wallet(&settings.wallet, settings.network.chain_id)? {
        let signer: Arc<dyn TransactionSigner> = Arc::new(wallet);
        let engine = ExecutionEngine::new(
            endpoint.clone(),
            signer,
            &settings.execution,
            settings.network.max_gas_price_gwei,
        );
        let account = engine.account();
        let nonce = engine.nonces().register(account).await?;
        info!("Signing as {:?} (next nonce {})", account, nonce);
        ctx = ctx.with_engine(Arc::new(engine));
    }

    if !provider.health_check().await {
        anyhow::bail!("Chain {} is not reachable", settings.network.chain_id);
    }
    let block = endpoint.block_number().await?;
    info!("Chain {} at block {}", endpoint.chain_id(), block);

    let connectors = Connector::build_all(&ctx);
    join_all(connectors.iter().map(log_status)).await;

    debug!("Metrics:\n{}", metrics::gather());
    info!("flare-agent status snapshot complete");
    Ok(())
}

async fn log_status(connector: &Connector) {
    let protocol = connector.protocol();
    match connector {
        Connector::Stargate(stargate) => match serde_json::to_string(&stargate.bridge_info()) {
            Ok(info) => info!("{} bridge: {}", protocol, info),
            Err(e) => warn!("{} bridge info not serializable: {}", protocol, e),
        },
        Connector::Kinetic(kinetic) => match kinetic.exchange_rate().await {
            Ok(rate) => info!("{} exchange rate mantissa: {}", protocol, rate.total_assets()),
            Err(e) => warn!("{}", e),
        },
        Connector::Sceptre(sceptre) => match sceptre.exchange_rate().await {
            Ok(rate) => match rate.assets_per_share() {
                Ok(per_share) => info!("{} FLR per sFLR: {}", protocol, wad(per_share)),
                Err(e) => warn!("{} exchange rate unavailable: {}", protocol, e),
            },
            Err(e) => warn!("{}", e),
        },
        Connector::Firelight(firelight) => match firelight.current_period().await {
            Ok(period) => info!("{} current withdrawal period: {}", protocol, period),
            Err(e) => warn!("{}", e),
        },
        Connector::Cyclo(_) | Connector::SparkDex(_) => {
            info!("{} ready (signing: {})", protocol, connector.can_sign());
        }
    }
}

fn wad(value: U256) -> String {
    format_units(value, 18).unwrap_or_else(|_| value.to_string())
}
