//! Ledger record types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::Amount;

/// Reference to one transaction output
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    pub tx_id: String,
    pub vout: u32,
}

impl OutPoint {
    pub fn new(tx_id: impl Into<String>, vout: u32) -> Self {
        Self {
            tx_id: tx_id.into(),
            vout,
        }
    }
}

impl std::fmt::Display for OutPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.tx_id, self.vout)
    }
}

/// HD wallet owned by an app
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    pub wallet_id: String,
    pub alias: String,
    /// Root extended public key addresses are derived from
    pub root_pub: String,
    /// Encrypted private key file
    pub key_file: PathBuf,
    /// Cached balance per asset symbol
    #[serde(default)]
    pub balances: BTreeMap<String, Amount>,
    pub created_at: DateTime<Utc>,
}

impl Wallet {
    pub fn new(
        wallet_id: impl Into<String>,
        alias: impl Into<String>,
        root_pub: impl Into<String>,
        key_file: PathBuf,
    ) -> Self {
        Self {
            wallet_id: wallet_id.into(),
            alias: alias.into(),
            root_pub: root_pub.into(),
            key_file,
            balances: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn balance(&self, symbol: &str) -> Amount {
        self.balances.get(symbol).copied().unwrap_or(0)
    }
}

/// Address derived from a wallet for one asset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub address: String,
    pub wallet_id: String,
    pub symbol: String,
    pub hd_path: String,
    pub index: u32,
    #[serde(default)]
    pub is_change: bool,
    /// Native balance
    #[serde(default)]
    pub balance: Amount,
    /// Token balances keyed by contract address
    #[serde(default)]
    pub token_balances: BTreeMap<String, Amount>,
    pub created_at: DateTime<Utc>,
}

/// Reservation state of an unspent output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SpendState {
    Unspent,
    /// Consumed by a broadcast transaction not yet seen in a block
    PendingSpend { tx_id: String },
}

/// Spendable output tracked by the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnspentOutput {
    pub outpoint: OutPoint,
    pub address: String,
    pub wallet_id: String,
    pub symbol: String,
    pub amount: Amount,
    /// Block the output was confirmed in, None while in the mempool
    #[serde(default)]
    pub block_height: Option<u64>,
    /// Confirmations last reported by the chain
    #[serde(default)]
    pub confirmations: u64,
    pub state: SpendState,
}

impl UnspentOutput {
    /// Ledger key, `txid:vout`
    pub fn id(&self) -> String {
        self.outpoint.to_string()
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.state, SpendState::PendingSpend { .. })
    }

    /// Confirmations relative to `tip`, or the last reported count when the tip is unknown
    pub fn confirmations_at(&self, tip: Option<u64>) -> u64 {
        match (tip, self.block_height) {
            (Some(tip), Some(height)) if tip >= height => tip - height + 1,
            (Some(_), Some(_)) => 0,
            _ => self.confirmations,
        }
    }
}

/// Outcome of one unspent rebuild
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebuildReport {
    pub wallet_id: String,
    pub symbol: String,
    pub inserted: usize,
    pub updated: usize,
    pub removed: usize,
    /// Pending reservations kept because the outputs are still unspent on chain
    pub kept_pending: usize,
    pub balance: Amount,
}

/// Per-wallet balance summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceSummary {
    pub wallet_id: String,
    pub symbol: String,
    pub balance: Amount,
    /// Part of `balance` reserved by pending spends
    pub pending: Amount,
    pub unspent_count: usize,
}

impl BalanceSummary {
    pub fn available(&self) -> Amount {
        self.balance.saturating_sub(self.pending)
    }
}
