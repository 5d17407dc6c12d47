//! Extraction results produced by a scan cycle

use serde::{Deserialize, Serialize};

use crate::ledger::types::OutPoint;
use crate::Amount;

/// Deposit to a watched address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recharge {
    pub symbol: String,
    /// Owner registered with the address, the application id for ledger addresses
    pub source_key: String,
    pub address: String,
    pub tx_id: String,
    /// Output index within the transaction
    pub index: u32,
    pub amount: Amount,
    /// Token contract, None for the native coin
    #[serde(default)]
    pub token: Option<String>,
    pub block_height: u64,
    pub block_hash: String,
}

impl Recharge {
    /// Output this deposit created on a UTXO chain
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.tx_id.clone(), self.index)
    }
}

/// Value spent from a watched address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpentInput {
    pub symbol: String,
    pub source_key: String,
    pub address: String,
    /// Spending transaction
    pub tx_id: String,
    /// Consumed output, None on account chains
    #[serde(default)]
    pub prev_out: Option<OutPoint>,
    pub amount: Amount,
    #[serde(default)]
    pub token: Option<String>,
}

/// Everything one transaction did to the watched address set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractResult {
    pub symbol: String,
    pub tx_id: String,
    pub block_height: u64,
    pub block_hash: String,
    #[serde(default)]
    pub recharges: Vec<Recharge>,
    #[serde(default)]
    pub spent: Vec<SpentInput>,
    pub success: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

impl ExtractResult {
    /// Source keys touched by this result, deduplicated and sorted
    pub fn source_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self
            .recharges
            .iter()
            .map(|r| r.source_key.as_str())
            .chain(self.spent.iter().map(|s| s.source_key.as_str()))
            .collect();
        keys.sort_unstable();
        keys.dedup();
        keys
    }
}

/// Summary of one scan cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Chain tip observed at the start of the cycle
    pub tip: u64,
    /// Heights scanned, in order
    pub scanned: Vec<u64>,
    /// Results delivered to observers
    pub delivered: usize,
    /// Transactions skipped as already delivered
    pub duplicates: usize,
}
