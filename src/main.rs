//! Blueberry Bank Liquidation Engine
//!
//! Watches every bank position, liquidates the profitable unhealthy ones
//! through the liquidator contract and accounts for the proceeds.
//! Features:
//! - Block-pinned snapshots polled over HTTP
//! - Paraswap-quoted plans costed for gas and protocol fee
//! - One transaction in flight per position, with gas bumping
//! - Journaled attempts and settlements for restart recovery

use std::sync::Arc;

use alloy::primitives::U256;
use anyhow::Result;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use blueberry_api::ParaswapClient;
use blueberry_chain::{LiquidatorContract, ProviderManager, TransactionSenderBuilder};
use blueberry_core::u256_math::wad_to_f64;
use blueberry_core::{
    alert_channel, config, init_config, load_engine_config, AlertReceiver, DeploymentEnv, Engine,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Print startup banner
    print_banner();

    // Load environment variables
    dotenvy::dotenv().ok();

    init_tracing();

    // ENGINE_CONFIG names a TOML file; otherwise ENGINE_PROFILE picks
    // testing, production or aggressive.
    init_config(load_engine_config()?);
    let engine_config = config();
    engine_config.log_config();

    let deployment = DeploymentEnv::from_env()?;
    info!(?deployment, "Deployment loaded");

    // Bank reads
    let provider = Arc::new(
        ProviderManager::new(&deployment.rpc_url, deployment.bank, deployment.oracle).await?,
    );
    info!(
        bank = %deployment.bank,
        oracle = %deployment.oracle,
        "Provider initialized"
    );

    // Swap quotes
    let quotes = Arc::new(match &deployment.paraswap_url {
        Some(url) => ParaswapClient::with_base_url(url.clone(), deployment.chain_id),
        None => ParaswapClient::new(deployment.chain_id),
    });

    // Transaction sender (signs and sends liquidations and sweeps)
    let mut builder = TransactionSenderBuilder::new(&deployment.rpc_url, deployment.chain_id)
        .gas_from_config(
            &deployment.gas_pricing,
            deployment.default_gas_price_gwei,
            deployment.max_gas_price_gwei,
            deployment.priority_fee_gwei,
        );
    if let Some(limit) = deployment.liquidation_gas_limit {
        builder = builder.gas_limit(limit);
    }
    let tx_sender = Arc::new(builder.build(&deployment.private_key).await?);
    let liquidator = Arc::new(LiquidatorContract::new(deployment.liquidator, tx_sender.clone()));
    info!(
        signer = %tx_sender.address,
        liquidator = %deployment.liquidator,
        gas_strategy = tx_sender.gas_strategy_name(),
        "Liquidator contract initialized"
    );
    match tx_sender.get_balance().await {
        Ok(balance) if balance.is_zero() => warn!(
            signer = %tx_sender.address,
            "Signer has no gas balance, submissions will halt until funded"
        ),
        Ok(balance) => info!(
            signer = %tx_sender.address,
            balance = format!("{:.4}", wad_to_f64(balance)),
            nonce = tx_sender.current_nonce(),
            "Signer ready"
        ),
        Err(e) => warn!(error = %e, "Signer balance unavailable"),
    }

    let (alerts, alerts_rx) = alert_channel();
    tokio::spawn(log_alerts(alerts_rx));

    let engine = Engine::new(
        engine_config.clone(),
        provider,
        liquidator,
        quotes,
        deployment.native_token,
        alerts,
    )?;

    info!("Starting liquidation engine...");
    let handle = engine.start();

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    let totals = handle.totals();
    handle.shutdown().await;

    info!(
        settlements = totals.settlements,
        realized_usd = dollars(totals.realized_usd),
        swept_usd = dollars(totals.swept_usd),
        "Shutdown complete"
    );
    Ok(())
}

/// USD WAD as `$1234.56`.
fn dollars(wad: U256) -> String {
    format!("${:.2}", wad_to_f64(wad))
}

/// `LOG_FORMAT=json` switches to JSON lines.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,blueberry_core=debug,blueberry_chain=debug"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
}

async fn log_alerts(mut alerts: AlertReceiver) {
    while let Some(alert) = alerts.recv().await {
        error!(alert = ?alert, "OPERATOR ALERT: {alert}");
    }
    warn!("Alert channel closed");
}

/// Print startup banner.
fn print_banner() {
    println!(r#"
    ╔╗ ┬  ┬ ┬┌─┐┌┐ ┌─┐┬─┐┬─┐┬ ┬
    ╠╩╗│  │ │├┤ ├┴┐├┤ ├┬┘├┬┘└┬┘
    ╚═╝┴─┘└─┘└─┘└─┘└─┘┴└─┴└─ ┴
    Liquidation Engine v0.1.0
    "#);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dollars_formats_wad() {
        let wad = U256::from(10u64).pow(U256::from(18u64));
        assert_eq!(dollars(U256::from(780u64) * wad), "$780.00");
        assert_eq!(dollars(wad / U256::from(4u64)), "$0.25");
        assert_eq!(dollars(U256::ZERO), "$0.00");
    }
}
