//! Chain adapters
//!
//! Every supported chain plugs in through [`AssetAdapter`]. The core never
//! speaks a chain's wire format; it only consumes the chain-neutral block
//! and transaction shapes defined here.
//!
//! # Architecture
//!
//! ```text
//! AssetRegistry ──symbol──▶ AssetAdapter ──▶ BlockScanner (per chain)
//!                               │
//!                               ├── BlockSource (fetch_block, current_height)
//!                               ├── derive_address / validate_address
//!                               └── list_unspent / get_balance / sign / broadcast
//! ```

pub mod registry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::ledger::types::{OutPoint, Wallet};
use crate::scanner::BlockScanner;
use crate::transaction::fee::SizeModel;
use crate::transaction::UnsignedTransaction;
use crate::Amount;

pub use registry::AssetRegistry;

/// How a chain represents value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainModel {
    /// Bitcoin-style unspent outputs
    Utxo,
    /// Ethereum-style account balances
    Account,
}

impl std::fmt::Display for ChainModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainModel::Utxo => write!(f, "utxo"),
            ChainModel::Account => write!(f, "account"),
        }
    }
}

/// A block in chain-neutral form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,
    pub hash: String,
    pub prev_hash: String,
    #[serde(default)]
    pub transactions: Vec<ChainTransaction>,
}

/// A transaction in chain-neutral form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainTransaction {
    pub tx_id: String,
    #[serde(default)]
    pub inputs: Vec<TxInput>,
    #[serde(default)]
    pub outputs: Vec<TxOutput>,
    /// Set when the chain included the transaction but it failed (reverted call, etc.)
    #[serde(default)]
    pub failure: Option<String>,
}

impl ChainTransaction {
    /// Every address this transaction touches, inputs first
    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        self.inputs
            .iter()
            .filter_map(|i| i.address.as_deref())
            .chain(self.outputs.iter().filter_map(|o| o.address.as_deref()))
    }
}

/// Value leaving an address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxInput {
    /// Output being consumed (UTXO chains only)
    #[serde(default)]
    pub prev_out: Option<OutPoint>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub amount: Amount,
    /// Token contract for token transfers
    #[serde(default)]
    pub token: Option<String>,
}

/// Value arriving at an address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxOutput {
    pub index: u32,
    #[serde(default)]
    pub address: Option<String>,
    pub amount: Amount,
    #[serde(default)]
    pub token: Option<String>,
}

/// An unspent output as reported by the chain backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteUnspent {
    pub outpoint: OutPoint,
    pub address: String,
    pub amount: Amount,
    pub confirmations: u64,
    #[serde(default)]
    pub block_height: Option<u64>,
}

/// Token contract on an account-model chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenContract {
    pub symbol: String,
    pub address: String,
    pub decimals: u32,
}

/// Everything an adapter needs to unlock a wallet's keys
#[derive(Clone)]
pub struct KeyMaterial {
    pub wallet_id: String,
    pub key_file: PathBuf,
    pub password: String,
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("wallet_id", &self.wallet_id)
            .field("key_file", &self.key_file)
            .field("password", &"***")
            .finish()
    }
}

/// Signed transaction ready for broadcast
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    pub symbol: String,
    pub tx_id: String,
    /// Chain-specific encoding, opaque to the core
    pub raw: String,
}

/// Read access to a chain's blocks
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Height of the chain tip
    async fn current_height(&self) -> Result<u64>;

    /// Block at `height`
    async fn fetch_block(&self, height: u64) -> Result<Block>;
}

/// Capabilities one chain provides to the core
#[async_trait]
pub trait AssetAdapter: BlockSource {
    /// Registry key, e.g. "BTC"
    fn symbol(&self) -> &str;

    fn model(&self) -> ChainModel;

    /// Fractional digits of the native coin
    fn decimals(&self) -> u32;

    /// Scanner for this chain, if the chain supports scanning
    fn block_scanner(&self) -> Option<Arc<BlockScanner>>;

    /// Derivation prefix; addresses live at `<root>/<change>/<index>`
    fn hd_root_path(&self) -> String {
        "m/44'/0'/0'".to_string()
    }

    /// Transaction size model; the configured default applies when None
    fn size_model(&self) -> Option<SizeModel> {
        None
    }

    /// Derive the address at `path` from the wallet's root public key
    fn derive_address(&self, wallet: &Wallet, path: &str) -> Result<String>;

    fn validate_address(&self, address: &str) -> bool;

    /// Authoritative unspent outputs for the given addresses
    async fn list_unspent(&self, addresses: &[String]) -> Result<Vec<RemoteUnspent>> {
        let _ = addresses;
        Err(Error::UnsupportedAsset(format!(
            "{} does not track unspent outputs",
            self.symbol()
        )))
    }

    /// Authoritative balance of an address, native coin or token
    async fn get_balance(&self, address: &str, token: Option<&TokenContract>) -> Result<Amount> {
        let _ = (address, token);
        Err(Error::UnsupportedAsset(format!(
            "{} does not report account balances",
            self.symbol()
        )))
    }

    async fn sign_transaction(
        &self,
        tx: &UnsignedTransaction,
        key: &KeyMaterial,
    ) -> Result<SignedTransaction>;

    /// Submit a signed transaction, returning its tx id
    async fn broadcast_transaction(&self, tx: &SignedTransaction) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_addresses() {
        let tx = ChainTransaction {
            tx_id: "t1".to_string(),
            inputs: vec![TxInput {
                prev_out: None,
                address: Some("in".to_string()),
                amount: 3,
                token: None,
            }],
            outputs: vec![
                TxOutput {
                    index: 0,
                    address: Some("out".to_string()),
                    amount: 2,
                    token: None,
                },
                TxOutput {
                    index: 1,
                    address: None,
                    amount: 0,
                    token: None,
                },
            ],
            failure: None,
        };

        let addresses: Vec<&str> = tx.addresses().collect();
        assert_eq!(addresses, vec!["in", "out"]);
    }

    #[test]
    fn test_key_material_debug_masks_password() {
        let key = KeyMaterial {
            wallet_id: "w1".to_string(),
            key_file: PathBuf::from("keys/w1.key"),
            password: "hunter2".to_string(),
        };
        let rendered = format!("{:?}", key);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("***"));
    }
}
