//! Wallet backup and restore
//!
//! A backup is a directory holding a copy of the wallet's encrypted key
//! file and `wallet.json`, an export of the wallet record with its
//! addresses and unspent outputs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::WalletManager;
use crate::error::{Error, Result};
use crate::ledger::{Address, UnspentOutput, Wallet};

/// File name of the record export inside a backup directory
pub const BACKUP_MANIFEST: &str = "wallet.json";

const BACKUP_VERSION: u32 = 1;

/// Contents of `wallet.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletBackup {
    pub version: u32,
    /// Application the wallet was exported from
    pub app_id: String,
    pub wallet: Wallet,
    pub addresses: Vec<Address>,
    #[serde(default)]
    pub unspent: Vec<UnspentOutput>,
    pub created_at: DateTime<Utc>,
}

fn key_file_name(wallet: &Wallet) -> Result<&std::ffi::OsStr> {
    wallet.key_file.file_name().ok_or_else(|| {
        Error::Config(format!(
            "wallet {} has no key file name: {}",
            wallet.wallet_id,
            wallet.key_file.display()
        ))
    })
}

impl WalletManager {
    /// Copy a wallet's key file and records into a new directory under `dest_root`.
    ///
    /// Returns the backup directory, named `<alias>-<wallet_id>-<timestamp>`.
    pub async fn backup_wallet(&self, app_id: &str, wallet_id: &str, dest_root: &Path) -> Result<PathBuf> {
        let store = self.open_db(app_id).await?;
        let (wallet, addresses, unspent) = store.export_wallet(wallet_id).await?;
        let key_name = key_file_name(&wallet)?;

        let created_at = Utc::now();
        let dir = dest_root.join(format!(
            "{}-{}-{}",
            wallet.alias,
            wallet.wallet_id,
            created_at.format("%Y%m%d%H%M%S")
        ));
        tokio::fs::create_dir_all(&dir).await?;

        tokio::fs::copy(&wallet.key_file, dir.join(key_name))
            .await
            .map_err(|e| Error::Io(format!("{}: {}", wallet.key_file.display(), e)))?;

        let manifest = WalletBackup {
            version: BACKUP_VERSION,
            app_id: app_id.to_string(),
            addresses,
            unspent,
            created_at,
            wallet,
        };
        tokio::fs::write(dir.join(BACKUP_MANIFEST), serde_json::to_vec_pretty(&manifest)?).await?;

        info!(
            "[{}] Backed up wallet {} to {}",
            app_id,
            wallet_id,
            dir.display()
        );
        Ok(dir)
    }

    /// Import a backup directory into `app_id` and start watching its addresses.
    ///
    /// The key file lands in the configured key directory. An existing key file
    /// with different contents, a wallet id already present or an address owned
    /// by another wallet fails the restore and leaves everything as it was.
    pub async fn restore_wallet(&self, app_id: &str, backup_dir: &Path) -> Result<Wallet> {
        let manifest_path = backup_dir.join(BACKUP_MANIFEST);
        let bytes = tokio::fs::read(&manifest_path)
            .await
            .map_err(|e| Error::Io(format!("{}: {}", manifest_path.display(), e)))?;
        let backup: WalletBackup = serde_json::from_slice(&bytes)
            .map_err(|e| Error::Deserialization(format!("{}: {}", manifest_path.display(), e)))?;
        if backup.version != BACKUP_VERSION {
            return Err(Error::Config(format!(
                "unsupported backup version {} in {}",
                backup.version,
                manifest_path.display()
            )));
        }

        let store = self.open_db(app_id).await?;
        let key_name = key_file_name(&backup.wallet)?.to_owned();
        let source_key = backup_dir.join(&key_name);
        let key_contents = tokio::fs::read(&source_key)
            .await
            .map_err(|e| Error::Io(format!("{}: {}", source_key.display(), e)))?;

        tokio::fs::create_dir_all(&self.config.manager.key_dir).await?;
        let key_file = self.config.manager.key_dir.join(&key_name);
        let copied = match tokio::fs::read(&key_file).await {
            Ok(existing) if existing == key_contents => false,
            Ok(_) => {
                return Err(Error::Config(format!(
                    "key file {} exists with different contents",
                    key_file.display()
                )))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tokio::fs::write(&key_file, &key_contents).await?;
                true
            }
            Err(e) => return Err(e.into()),
        };

        let mut wallet = backup.wallet;
        wallet.key_file = key_file.clone();
        let addresses = backup.addresses;

        if let Err(e) = store
            .import_wallet(wallet.clone(), addresses.clone(), backup.unspent)
            .await
        {
            if copied {
                if let Err(remove) = tokio::fs::remove_file(&key_file).await {
                    warn!("Failed to remove {}: {}", key_file.display(), remove);
                }
            }
            return Err(e);
        }

        let mut watched = 0;
        for address in &addresses {
            match self.scanner(&address.symbol).ok() {
                Some(scanner) => {
                    scanner.add_address(address.address.clone(), app_id);
                    watched += 1;
                }
                None => warn!(
                    "[{}] {} address {} restored but not watched: no scanner",
                    app_id, address.symbol, address.address
                ),
            }
        }

        info!(
            "[{}] Restored wallet {} from {} ({} of {} addresses watched)",
            app_id,
            wallet.wallet_id,
            backup_dir.display(),
            watched,
            addresses.len()
        );
        Ok(wallet)
    }
}
