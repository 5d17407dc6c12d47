//! Local ledger
//!
//! Per-application persistent state: wallets, derived addresses, unspent
//! outputs and cached balances, plus reconciliation against the chain.

pub mod rebuild;
pub mod store;
pub mod types;

pub use rebuild::{reconcile, UnspentDiff};
pub use store::LedgerStore;
pub use types::{
    Address, BalanceSummary, OutPoint, RebuildReport, SpendState, UnspentOutput, Wallet,
};
