//! Outgoing transactions
//!
//! Fee estimation, coin selection and construction of unsigned
//! transactions for both UTXO and account chains, plus exact unit
//! conversion for user-entered amounts.

pub mod account;
pub mod builder;
pub mod coin_selection;
pub mod fee;
pub mod units;

pub use builder::{PlannedOutput, Recipient, TransactionBuilder, UnsignedTransaction};
pub use coin_selection::{CoinSelector, SelectionResult};
pub use fee::{estimate_fee, FeeRate, SizeModel};
pub use units::{format_amount, parse_amount, Unit};
