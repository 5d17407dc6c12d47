//! CLI command implementations

use anyhow::{Context, Result};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::assets::AssetRegistry;
use crate::config::Config;
use crate::manager::WalletManager;
use crate::transaction::{format_amount, FeeRate, Unit};

fn manager(config: &Config) -> Arc<WalletManager> {
    WalletManager::new(config.clone(), AssetRegistry::new())
}

/// Boot the wallet manager and scan until Ctrl-C
pub async fn start(config: &Config, registry: AssetRegistry) -> Result<()> {
    info!("Starting chainvault...");
    if registry.is_empty() {
        warn!("No chain adapters registered; ledgers are served but nothing is scanned");
    }

    let manager = WalletManager::new(config.clone(), registry);
    manager.init().await.context("Failed to initialize wallet manager")?;

    for symbol in &config.manager.supported_assets {
        match manager.scanner(symbol) {
            Ok(scanner) => info!("{} scanner: {:?}", symbol, scanner.status()),
            Err(e) => warn!("{}: {}", symbol, e),
        }
    }

    info!("Running. Press Ctrl-C to stop.");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("Shutting down...");
    manager.shutdown().await?;
    Ok(())
}

/// Show the effective configuration
pub fn show_config(config: &Config) -> Result<()> {
    println!("{}", config.masked_display());
    Ok(())
}

/// List application databases
pub async fn apps(config: &Config) -> Result<()> {
    let app_ids = manager(config).list_app_ids().await?;

    println!("\n=== APPLICATIONS ===\n");
    if app_ids.is_empty() {
        println!("No application databases in {}", config.manager.db_dir.display());
    }
    for app_id in app_ids {
        println!("{}", app_id);
    }
    println!();
    Ok(())
}

/// List the wallets of one application
pub async fn wallets(config: &Config, app_id: &str) -> Result<()> {
    let manager = manager(config);
    let wallets = manager.list_wallets(app_id).await?;

    println!("\n=== WALLETS ({}) ===\n", app_id);
    println!("{:<34} {:<15} {:<25} {}", "WALLET ID", "ALIAS", "CREATED", "BALANCES");
    println!("{}", "-".repeat(90));

    for wallet in wallets {
        let balances = wallet
            .balances
            .iter()
            .map(|(symbol, amount)| format!("{}={}", symbol, amount))
            .collect::<Vec<_>>()
            .join(" ");
        println!(
            "{:<34} {:<15} {:<25} {}",
            wallet.wallet_id,
            wallet.alias,
            wallet.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
            balances
        );
    }

    println!();
    manager.shutdown().await?;
    Ok(())
}

/// List the addresses of one wallet
/// Copy a wallet's key file and records to `dest`
pub async fn backup(config: &Config, app_id: &str, wallet_id: &str, dest: &str) -> Result<()> {
    let manager = manager(config);
    let dir = manager
        .backup_wallet(app_id, wallet_id, Path::new(dest))
        .await
        .with_context(|| format!("backup of wallet {} failed", wallet_id))?;
    println!("Wallet {} backed up to {}", wallet_id, dir.display());
    manager.shutdown().await?;
    Ok(())
}

/// Import a backup directory into `app_id`
pub async fn restore(config: &Config, app_id: &str, from: &str) -> Result<()> {
    let manager = manager(config);
    let wallet = manager
        .restore_wallet(app_id, Path::new(from))
        .await
        .with_context(|| format!("restore from {} failed", from))?;
    println!("Wallet {} ({}) restored into {}", wallet.wallet_id, wallet.alias, app_id);
    manager.shutdown().await?;
    Ok(())
}

pub async fn addresses(
    config: &Config,
    app_id: &str,
    wallet_id: &str,
    symbol: Option<&str>,
    offset: usize,
    limit: usize,
) -> Result<()> {
    let manager = manager(config);
    let addresses = manager
        .list_addresses(app_id, wallet_id, symbol, offset, limit)
        .await?;

    println!("\n=== ADDRESSES ({}) ===\n", wallet_id);
    println!("{:<8} {:<22} {:<45} {}", "SYMBOL", "PATH", "ADDRESS", "BALANCE");
    println!("{}", "-".repeat(90));

    for address in addresses {
        println!(
            "{:<8} {:<22} {:<45} {}",
            address.symbol, address.hd_path, address.address, address.balance
        );
    }

    println!();
    manager.shutdown().await?;
    Ok(())
}

/// List the locally tracked unspent outputs of one wallet
pub async fn unspent(config: &Config, app_id: &str, wallet_id: &str, symbol: &str) -> Result<()> {
    let manager = manager(config);
    let unspent = manager.list_unspent(app_id, wallet_id, symbol).await?;
    let summary = manager.balance_summary(app_id, wallet_id, symbol).await?;

    println!("\n=== UNSPENT {} ({}) ===\n", symbol, wallet_id);
    println!("{:<70} {:>20} {:>8} {}", "OUTPOINT", "AMOUNT", "HEIGHT", "STATE");
    println!("{}", "-".repeat(110));

    for output in unspent {
        let height = output
            .block_height
            .map(|h| h.to_string())
            .unwrap_or_else(|| "-".to_string());
        let state = if output.is_pending() { "pending" } else { "unspent" };
        println!(
            "{:<70} {:>20} {:>8} {}",
            output.id(),
            output.amount,
            height,
            state
        );
    }

    println!(
        "\nBalance: {}  Pending: {}  Available: {}  Outputs: {}\n",
        summary.balance,
        summary.pending,
        summary.available(),
        summary.unspent_count
    );
    manager.shutdown().await?;
    Ok(())
}

/// Convert an amount between denominations
pub fn convert(amount: &str, unit: &str) -> Result<()> {
    let unit = Unit::from_str(unit)?;
    let base = unit.to_base_units(amount)?;

    println!("\n{} {} =\n", amount, unit);
    for target in Unit::ALL {
        println!("  {:>40} {}", format_amount(base, target.decimals()), target);
    }
    println!();
    Ok(())
}

/// Estimate a fee with the configured size model
pub fn fee(config: &Config, inputs: usize, outputs: usize, rate: u128) -> Result<()> {
    let model = config.transaction.size_model;
    let size = model.estimated_size(inputs, outputs);
    let fee = model.estimate_fee(inputs, outputs, FeeRate::per_byte(rate));

    println!("Inputs: {}  Outputs: {}  Rate: {}", inputs, outputs, rate);
    println!("Estimated size: {} bytes", size);
    println!("Estimated fee: {}", fee);
    Ok(())
}
