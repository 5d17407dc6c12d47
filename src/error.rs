//! Error types for the wallet backend

use thiserror::Error;

/// Result type alias using our custom Error
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of errors, used by callers to decide how to react
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Setup problem; fatal to the operation, never to the process
    Configuration,
    /// Unknown application, wallet or address
    NotFound,
    /// Request refused before anything was submitted
    Rejected,
    /// Chain reorganization, resolved by a rescan
    Reorg,
    /// Backend unreachable or slow; retry later
    TransientIo,
    /// Reconciliation raced a live update; retry the whole operation
    ConcurrencyConflict,
    /// Everything else
    Internal,
}

/// Main error type for the wallet backend
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Block scanner has not set scan task: {0}")]
    ScannerNotConfigured(String),

    #[error("Block scanner is stopped: {0}")]
    ScannerStopped(String),

    #[error("Asset not supported: {0}")]
    UnsupportedAsset(String),

    #[error("Invalid application id: {0}")]
    InvalidAppId(String),

    // Lookup errors
    #[error("Application not found: {0}")]
    AppNotFound(String),

    #[error("Wallet not found: {0}")]
    WalletNotFound(String),

    #[error("Address not found: {0}")]
    AddressNotFound(String),

    // Transaction errors
    #[error("Insufficient funds: {available} available, {required} required")]
    InsufficientFunds { available: u128, required: u128 },

    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Address {address} already belongs to wallet {owner}")]
    DuplicateAddress { address: String, owner: String },

    #[error("Derivation path {hd_path} already used by wallet {wallet_id}")]
    AddressIndexTaken { wallet_id: String, hd_path: String },

    #[error("Wallet already exists: {0}")]
    WalletExists(String),

    // Scanning errors
    #[error("Chain reorganization at height {height}: expected parent {expected}, got {actual}")]
    ReorgDetected {
        height: u64,
        expected: String,
        actual: String,
    },

    // Chain backend errors
    #[error("Chain backend error: {0}")]
    Rpc(String),

    #[error("Chain backend timeout after {0}ms")]
    RpcTimeout(u64),

    #[error("Chain backend unreachable: {0}")]
    RpcConnection(String),

    #[error("Block not found at height {0}")]
    BlockNotFound(u64),

    // Ledger errors
    #[error("Concurrent update while reconciling wallet {0}, retry the rebuild")]
    ConcurrencyConflict(String),

    #[error("Timed out opening database for {app_id} after {timeout_ms}ms")]
    StoreOpenTimeout { app_id: String, timeout_ms: u64 },

    #[error("Database is closed: {0}")]
    StoreClosed(String),

    #[error("Persistence failed: {0}")]
    Persistence(String),

    // Signing and submission errors
    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Transaction broadcast failed: {0}")]
    Broadcast(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is retryable (transient)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Rpc(_) | Error::RpcTimeout(_) | Error::RpcConnection(_) | Error::StoreOpenTimeout { .. }
        )
    }

    /// Map this error onto the recovery taxonomy
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Config(_)
            | Error::ScannerNotConfigured(_)
            | Error::ScannerStopped(_)
            | Error::UnsupportedAsset(_)
            | Error::InvalidAppId(_) => ErrorCategory::Configuration,
            Error::AppNotFound(_)
            | Error::WalletNotFound(_)
            | Error::AddressNotFound(_)
            | Error::BlockNotFound(_) => ErrorCategory::NotFound,
            Error::InsufficientFunds { .. }
            | Error::InvalidRecipient(_)
            | Error::InvalidAmount(_)
            | Error::DuplicateAddress { .. }
            | Error::AddressIndexTaken { .. }
            | Error::WalletExists(_) => ErrorCategory::Rejected,
            Error::ReorgDetected { .. } => ErrorCategory::Reorg,
            Error::Rpc(_)
            | Error::RpcTimeout(_)
            | Error::RpcConnection(_)
            | Error::StoreOpenTimeout { .. } => ErrorCategory::TransientIo,
            Error::ConcurrencyConflict(_) => ErrorCategory::ConcurrencyConflict,
            Error::StoreClosed(_)
            | Error::Persistence(_)
            | Error::Signing(_)
            | Error::Broadcast(_)
            | Error::Serialization(_)
            | Error::Deserialization(_)
            | Error::Io(_)
            | Error::Internal(_)
            | Error::Anyhow(_) => ErrorCategory::Internal,
        }
    }
}

// Conversion from serde_json errors
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

// Conversion from I/O errors
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(Error::RpcTimeout(3000).is_retryable());
        assert!(Error::RpcConnection("refused".to_string()).is_retryable());
        assert!(!Error::InvalidRecipient("bad".to_string()).is_retryable());
        assert!(!Error::ConcurrencyConflict("w1".to_string()).is_retryable());
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(
            Error::ScannerNotConfigured("BTC".to_string()).category(),
            ErrorCategory::Configuration
        );
        assert_eq!(
            Error::InsufficientFunds {
                available: 1,
                required: 2
            }
            .category(),
            ErrorCategory::Rejected
        );
        assert_eq!(
            Error::ReorgDetected {
                height: 10,
                expected: "aa".to_string(),
                actual: "bb".to_string()
            }
            .category(),
            ErrorCategory::Reorg
        );
        assert_eq!(
            Error::Rpc("down".to_string()).category(),
            ErrorCategory::TransientIo
        );
    }
}
