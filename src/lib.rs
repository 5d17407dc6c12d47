//! chainvault wallet backend library
//!
//! Multi-chain custody core: per-chain block scanners feed deposits and
//! spends into per-application ledgers, and the transaction builder turns
//! a wallet's unspent outputs into transactions for chain adapters to sign.

pub mod assets;
pub mod cli;
pub mod config;
pub mod error;
pub mod ledger;
pub mod manager;
pub mod scanner;
pub mod transaction;

#[cfg(test)]
mod test_utils;

/// Value in a chain's smallest unit
pub type Amount = u128;

// Re-export commonly used types
pub use assets::{AssetAdapter, AssetRegistry, ChainModel};
pub use config::Config;
pub use error::{Error, Result};
pub use manager::WalletManager;
pub use scanner::BlockScanner;
pub use transaction::TransactionBuilder;
