//! chainvault - multi-chain wallet backend
//!
//! The binary ships no chain adapters. Embedders build an `AssetRegistry`
//! with their adapters and drive `WalletManager` from the library.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use chainvault::assets::AssetRegistry;
use chainvault::cli::commands;
use chainvault::config::Config;

/// Multi-chain wallet backend
#[derive(Parser)]
#[command(name = "chainvault")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "chainvault.toml")]
    config: String,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Boot the wallet manager and scan until Ctrl-C
    Start,

    /// Show current configuration
    Config,

    /// List application databases
    Apps,

    /// List the wallets of an application
    Wallets {
        #[arg(long)]
        app: String,
    },

    /// List the addresses of a wallet
    Addresses {
        #[arg(long)]
        app: String,

        #[arg(long)]
        wallet: String,

        /// Only this asset
        #[arg(long)]
        symbol: Option<String>,

        #[arg(long, default_value = "0")]
        offset: usize,

        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Copy a wallet's key file and records into a backup directory
    Backup {
        #[arg(long)]
        app: String,

        #[arg(long)]
        wallet: String,

        /// Directory that receives the backup
        #[arg(long, default_value = "data/backup")]
        dest: String,
    },

    /// Import a wallet backup directory
    Restore {
        #[arg(long)]
        app: String,

        /// Backup directory written by `backup`
        #[arg(long)]
        from: String,
    },

    /// List the unspent outputs of a wallet
    Unspent {
        #[arg(long)]
        app: String,

        #[arg(long)]
        wallet: String,

        #[arg(long, default_value = "BTC")]
        symbol: String,
    },

    /// Convert an amount between denominations
    Convert {
        /// Decimal amount, e.g. "1.5"
        amount: String,

        /// Unit of `amount`: wei, kwei, mwei, gwei, microether, milliether, ether
        #[arg(long, default_value = "ether")]
        unit: String,
    },

    /// Estimate a transaction fee
    Fee {
        #[arg(long, default_value = "1")]
        inputs: usize,

        #[arg(long, default_value = "2")]
        outputs: usize,

        /// Fee rate in base units per byte
        #[arg(long)]
        rate: u128,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chainvault=info"));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Parse CLI arguments
    let cli = Cli::parse();

    init_tracing(cli.json_logs);

    // Load configuration
    let config = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    // Execute command
    let result = match cli.command {
        Commands::Start => commands::start(&config, AssetRegistry::new()).await,
        Commands::Config => commands::show_config(&config),
        Commands::Apps => commands::apps(&config).await,
        Commands::Wallets { app } => commands::wallets(&config, &app).await,
        Commands::Addresses {
            app,
            wallet,
            symbol,
            offset,
            limit,
        } => commands::addresses(&config, &app, &wallet, symbol.as_deref(), offset, limit).await,
        Commands::Backup { app, wallet, dest } => commands::backup(&config, &app, &wallet, &dest).await,
        Commands::Restore { app, from } => commands::restore(&config, &app, &from).await,
        Commands::Unspent { app, wallet, symbol } => {
            commands::unspent(&config, &app, &wallet, &symbol).await
        }
        Commands::Convert { amount, unit } => commands::convert(&amount, &unit),
        Commands::Fee {
            inputs,
            outputs,
            rate,
        } => commands::fee(&config, inputs, outputs, rate),
    };

    if let Err(e) = result {
        error!("Command failed: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}
