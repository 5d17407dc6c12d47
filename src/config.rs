//! Configuration loading and validation

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::transaction::fee::SizeModel;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub manager: ManagerConfig,
    #[serde(default)]
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub transaction: TransactionConfig,
    #[serde(default)]
    pub summary: SummaryConfig,
}

/// Wallet manager and database layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Directory holding one `<app_id>.db` file per application
    #[serde(default = "default_db_dir")]
    pub db_dir: PathBuf,

    /// Directory holding encrypted key files
    #[serde(default = "default_key_dir")]
    pub key_dir: PathBuf,

    /// Chain symbols whose scanners are started at boot
    #[serde(default)]
    pub supported_assets: Vec<String>,

    /// Upper bound for loading an application database
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,
}

impl ManagerConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            db_dir: default_db_dir(),
            key_dir: default_key_dir(),
            supported_assets: Vec::new(),
            open_timeout_ms: default_open_timeout_ms(),
        }
    }
}

/// Block scanner tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    /// Seconds between scan cycles
    #[serde(default = "default_period_secs")]
    pub period_secs: u64,

    /// Blocks processed per cycle while catching up
    #[serde(default = "default_max_blocks_per_cycle")]
    pub max_blocks_per_cycle: u32,

    /// First height scanned when nothing has been scanned yet (None = chain tip)
    #[serde(default)]
    pub start_height: Option<u64>,

    /// Number of blocks for which delivered tx ids are remembered
    #[serde(default = "default_dedup_window")]
    pub dedup_window: u64,

    /// Attempts per block fetch before the cycle gives up
    #[serde(default = "default_fetch_retries")]
    pub fetch_retries: u32,

    /// Initial backoff between fetch attempts
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

impl ScannerConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            period_secs: default_period_secs(),
            max_blocks_per_cycle: default_max_blocks_per_cycle(),
            start_height: None,
            dedup_window: default_dedup_window(),
            fetch_retries: default_fetch_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

/// Transaction construction parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionConfig {
    /// Change below this value is folded into the fee
    #[serde(default = "default_dust_threshold")]
    pub dust_threshold: u64,

    /// Outputs need at least this many confirmations to be selected
    #[serde(default = "default_min_confirmations")]
    pub min_confirmations: u64,

    /// Fallback size model for chains that do not provide one
    #[serde(default)]
    pub size_model: SizeModel,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            dust_threshold: default_dust_threshold(),
            min_confirmations: default_min_confirmations(),
            size_model: SizeModel::default(),
        }
    }
}

/// Periodic sweep of wallet balances to collection addresses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryConfig {
    /// Seconds between sweeps
    #[serde(default = "default_summary_period_secs")]
    pub period_secs: u64,

    /// Collection target per asset symbol
    #[serde(default)]
    pub assets: BTreeMap<String, SummaryTarget>,
}

impl SummaryConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }

    /// Target for `symbol`, matched case-insensitively
    pub fn target(&self, symbol: &str) -> Option<&SummaryTarget> {
        self.assets
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(symbol))
            .map(|(_, target)| target)
    }
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            period_secs: default_summary_period_secs(),
            assets: BTreeMap::new(),
        }
    }
}

/// Where one asset's balances are collected
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryTarget {
    /// Collection address
    pub address: String,

    /// Decimal amount in whole coins; smaller balances are left alone
    #[serde(default = "default_summary_threshold")]
    pub threshold: String,

    /// Base units per byte, or gas price on account chains
    #[serde(default = "default_summary_fee_rate")]
    pub fee_rate: u64,

    /// Tokens swept alongside the native coin (account chains)
    #[serde(default)]
    pub tokens: Vec<SummaryToken>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryToken {
    pub symbol: String,
    /// Contract address
    pub address: String,
    pub decimals: u32,
    #[serde(default = "default_summary_threshold")]
    pub threshold: String,
}

// Default value functions
fn default_db_dir() -> PathBuf {
    PathBuf::from("data/db")
}

fn default_key_dir() -> PathBuf {
    PathBuf::from("data/key")
}

fn default_open_timeout_ms() -> u64 {
    3000
}

fn default_period_secs() -> u64 {
    5
}

fn default_max_blocks_per_cycle() -> u32 {
    1
}

fn default_dedup_window() -> u64 {
    1024
}

fn default_fetch_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    200
}

fn default_dust_threshold() -> u64 {
    546
}

fn default_min_confirmations() -> u64 {
    1
}

fn default_summary_period_secs() -> u64 {
    60
}

fn default_summary_threshold() -> String {
    "0".to_string()
}

fn default_summary_fee_rate() -> u64 {
    1
}

impl Default for Config {
    fn default() -> Self {
        Self {
            manager: ManagerConfig::default(),
            scanner: ScannerConfig::default(),
            transaction: TransactionConfig::default(),
            summary: SummaryConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment variables
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let settings = config::Config::builder()
            // Start with defaults
            .set_default("manager.db_dir", "data/db")?
            .set_default("manager.key_dir", "data/key")?
            .set_default("scanner.period_secs", default_period_secs() as i64)?
            // Load from file if exists
            .add_source(config::File::from(path).required(false))
            // Override with environment variables (prefix CHAINVAULT_)
            .add_source(
                config::Environment::with_prefix("CHAINVAULT")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("manager.supported_assets")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: Config = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.scanner.period_secs == 0 {
            anyhow::bail!("scanner.period_secs must be positive");
        }

        if self.scanner.max_blocks_per_cycle == 0 {
            anyhow::bail!("scanner.max_blocks_per_cycle must be positive");
        }

        if self.scanner.fetch_retries == 0 {
            anyhow::bail!("scanner.fetch_retries must be at least 1");
        }

        if self.manager.open_timeout_ms == 0 {
            anyhow::bail!("manager.open_timeout_ms must be positive");
        }

        if self.summary.period_secs == 0 {
            anyhow::bail!("summary.period_secs must be positive");
        }

        for (symbol, target) in &self.summary.assets {
            if target.address.trim().is_empty() {
                anyhow::bail!("summary.assets.{}.address is empty", symbol);
            }
        }

        // Symbols double as registry keys
        for symbol in &self.manager.supported_assets {
            if symbol.trim().is_empty() || symbol.chars().any(char::is_whitespace) {
                anyhow::bail!("Invalid asset symbol: {:?}", symbol);
            }
        }

        if self.manager.db_dir == self.manager.key_dir {
            tracing::warn!(
                "manager.db_dir and manager.key_dir point to the same directory: {}",
                self.manager.db_dir.display()
            );
        }

        Ok(())
    }

    /// Get configuration for display
    pub fn masked_display(&self) -> String {
        format!(
            r#"Configuration:
  Manager:
    db_dir: {}
    key_dir: {}
    supported_assets: {:?}
    open_timeout: {}ms
  Scanner:
    period: {}s
    max_blocks_per_cycle: {}
    start_height: {}
    dedup_window: {} blocks
    fetch_retries: {}
  Transaction:
    dust_threshold: {}
    min_confirmations: {}
    size_model: base={} per_input={} per_output={}
  Summary:
    period: {}s
    targets: {:?}
"#,
            self.manager.db_dir.display(),
            self.manager.key_dir.display(),
            self.manager.supported_assets,
            self.manager.open_timeout_ms,
            self.scanner.period_secs,
            self.scanner.max_blocks_per_cycle,
            self.scanner
                .start_height
                .map(|h| h.to_string())
                .unwrap_or_else(|| "(tip)".to_string()),
            self.scanner.dedup_window,
            self.scanner.fetch_retries,
            self.transaction.dust_threshold,
            self.transaction.min_confirmations,
            self.transaction.size_model.base,
            self.transaction.size_model.per_input,
            self.transaction.size_model.per_output,
            self.summary.period_secs,
            self.summary
                .assets
                .iter()
                .map(|(symbol, target)| format!("{}->{}", symbol, target.address))
                .collect::<Vec<_>>(),
        )
    }
}
