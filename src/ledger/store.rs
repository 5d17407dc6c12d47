//! Per-application ledger store
//!
//! One JSON document per application holding wallets, addresses and
//! unspent outputs in key-ordered maps. Every mutation is staged on a copy,
//! written to a temporary file and renamed over the database, then swapped
//! into memory, so a failed write leaves both disk and memory untouched.
//!
//! Each commit copies and rewrites the whole document, so write cost grows
//! with the ledger. Sized for thousands of records per application.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info};

use super::types::{Address, BalanceSummary, OutPoint, SpendState, UnspentOutput, Wallet};
use crate::assets::ChainModel;
use crate::error::{Error, Result};
use crate::scanner::ExtractResult;
use crate::Amount;

/// On-disk layout of one application database
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct LedgerData {
    #[serde(default)]
    pub wallets: BTreeMap<String, Wallet>,
    /// Keyed by address string
    #[serde(default)]
    pub addresses: BTreeMap<String, Address>,
    /// Keyed by `txid:vout`
    #[serde(default)]
    pub unspents: BTreeMap<String, UnspentOutput>,
    /// Change counter per `wallet/symbol`
    #[serde(default)]
    pub revisions: BTreeMap<String, u64>,
    /// Scan results already applied, `symbol:tx_id` → block height
    #[serde(default)]
    pub applied: BTreeMap<String, u64>,
}

impl LedgerData {
    fn bump_revision(&mut self, wallet_id: &str, symbol: &str) {
        *self.revisions.entry(revision_key(wallet_id, symbol)).or_insert(0) += 1;
    }

    fn revision(&self, wallet_id: &str, symbol: &str) -> u64 {
        self.revisions
            .get(&revision_key(wallet_id, symbol))
            .copied()
            .unwrap_or(0)
    }

    /// Recompute cached balances of one wallet for one asset
    pub(crate) fn recompute_balances(&mut self, wallet_id: &str, symbol: &str, model: ChainModel) {
        if model == ChainModel::Utxo {
            let mut per_address: BTreeMap<&str, Amount> = BTreeMap::new();
            for output in self
                .unspents
                .values()
                .filter(|u| u.wallet_id == wallet_id && u.symbol == symbol)
            {
                let entry = per_address.entry(output.address.as_str()).or_insert(0);
                *entry = entry.saturating_add(output.amount);
            }
            for address in self
                .addresses
                .values_mut()
                .filter(|a| a.wallet_id == wallet_id && a.symbol == symbol)
            {
                address.balance = per_address.get(address.address.as_str()).copied().unwrap_or(0);
            }
        }

        let total = self
            .addresses
            .values()
            .filter(|a| a.wallet_id == wallet_id && a.symbol == symbol)
            .fold(0u128, |acc, a| acc.saturating_add(a.balance));

        if let Some(wallet) = self.wallets.get_mut(wallet_id) {
            wallet.balances.insert(symbol.to_string(), total);
        }
    }
}

pub(crate) fn revision_key(wallet_id: &str, symbol: &str) -> String {
    format!("{}/{}", wallet_id, symbol)
}

fn applied_key(symbol: &str, tx_id: &str) -> String {
    format!("{}:{}", symbol, tx_id)
}

/// Ledger for one application
pub struct LedgerStore {
    app_id: String,
    path: PathBuf,
    data: RwLock<LedgerData>,
    open: AtomicBool,
    wallet_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl LedgerStore {
    /// Load `<db_dir>/<app_id>.db`, creating an empty database when absent
    pub async fn open(app_id: &str, db_dir: &Path) -> Result<Self> {
        let path = db_dir.join(format!("{}.db", app_id));

        let data = match tokio::fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str::<LedgerData>(&content).map_err(|e| {
                Error::Deserialization(format!("{}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tokio::fs::create_dir_all(db_dir).await?;
                let data = LedgerData::default();
                write_atomic(&path, &data).await?;
                info!("Created database {}", path.display());
                data
            }
            Err(e) => return Err(e.into()),
        };

        debug!(
            "Opened database {} ({} wallets, {} addresses, {} unspent)",
            path.display(),
            data.wallets.len(),
            data.addresses.len(),
            data.unspents.len()
        );

        Ok(Self {
            app_id: app_id.to_string(),
            path,
            data: RwLock::new(data),
            open: AtomicBool::new(true),
            wallet_locks: DashMap::new(),
        })
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::StoreClosed(self.app_id.clone()))
        }
    }

    /// Flush to disk and refuse further operations
    pub async fn close(&self) -> Result<()> {
        let data = self.data.write().await;
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        write_atomic(&self.path, &data).await?;
        info!("Closed database {}", self.path.display());
        Ok(())
    }

    /// Mutual-exclusion boundary for updates to one wallet
    pub async fn lock_wallet(&self, wallet_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .wallet_locks
            .entry(wallet_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    async fn read<T>(&self, f: impl FnOnce(&LedgerData) -> T) -> Result<T> {
        let data = self.data.read().await;
        self.ensure_open()?;
        Ok(f(&data))
    }

    /// Stage `f` on a copy, persist it, then make it current.
    ///
    /// O(ledger size) per call: the full document is cloned and rewritten.
    pub(crate) async fn commit<T>(&self, f: impl FnOnce(&mut LedgerData) -> Result<T>) -> Result<T> {
        let mut data = self.data.write().await;
        self.ensure_open()?;

        let mut staged = LedgerData::clone(&data);
        let value = f(&mut staged)?;
        write_atomic(&self.path, &staged).await?;
        *data = staged;
        Ok(value)
    }

    // ---- wallets ----

    pub async fn create_wallet(&self, wallet: Wallet) -> Result<Wallet> {
        let created = self
            .commit(|data| {
                if data.wallets.contains_key(&wallet.wallet_id) {
                    return Err(Error::WalletExists(wallet.wallet_id.clone()));
                }
                data.wallets.insert(wallet.wallet_id.clone(), wallet.clone());
                Ok(wallet)
            })
            .await?;
        info!("[{}] Created wallet {} ({})", self.app_id, created.wallet_id, created.alias);
        Ok(created)
    }

    pub async fn get_wallet(&self, wallet_id: &str) -> Result<Wallet> {
        self.read(|data| data.wallets.get(wallet_id).cloned())
            .await?
            .ok_or_else(|| Error::WalletNotFound(wallet_id.to_string()))
    }

    pub async fn list_wallets(&self) -> Result<Vec<Wallet>> {
        self.read(|data| data.wallets.values().cloned().collect()).await
    }

    pub async fn update_wallet_alias(&self, wallet_id: &str, alias: &str) -> Result<Wallet> {
        self.commit(|data| {
            let wallet = data
                .wallets
                .get_mut(wallet_id)
                .ok_or_else(|| Error::WalletNotFound(wallet_id.to_string()))?;
            wallet.alias = alias.to_string();
            Ok(wallet.clone())
        })
        .await
    }

    /// Wallet record with every address and unspent output it owns
    pub async fn export_wallet(&self, wallet_id: &str) -> Result<(Wallet, Vec<Address>, Vec<UnspentOutput>)> {
        self.read(|data| {
            let wallet = data
                .wallets
                .get(wallet_id)
                .cloned()
                .ok_or_else(|| Error::WalletNotFound(wallet_id.to_string()))?;
            let addresses = data
                .addresses
                .values()
                .filter(|a| a.wallet_id == wallet_id)
                .cloned()
                .collect();
            let unspent = data
                .unspents
                .values()
                .filter(|u| u.wallet_id == wallet_id)
                .cloned()
                .collect();
            Ok((wallet, addresses, unspent))
        })
        .await?
    }

    /// Insert a wallet together with its records; all or nothing
    pub async fn import_wallet(
        &self,
        wallet: Wallet,
        addresses: Vec<Address>,
        unspent: Vec<UnspentOutput>,
    ) -> Result<()> {
        let wallet_id = wallet.wallet_id.clone();
        self.commit(|data| {
            if data.wallets.contains_key(&wallet.wallet_id) {
                return Err(Error::WalletExists(wallet.wallet_id.clone()));
            }
            for record in addresses.iter().map(|a| &a.wallet_id).chain(unspent.iter().map(|u| &u.wallet_id)) {
                if *record != wallet.wallet_id {
                    return Err(Error::Internal(format!(
                        "record of wallet {} in import of {}",
                        record, wallet.wallet_id
                    )));
                }
            }
            for address in &addresses {
                if let Some(existing) = data.addresses.get(&address.address) {
                    return Err(Error::DuplicateAddress {
                        address: address.address.clone(),
                        owner: existing.wallet_id.clone(),
                    });
                }
            }

            let symbols: BTreeSet<String> = addresses.iter().map(|a| a.symbol.clone()).collect();
            data.wallets.insert(wallet.wallet_id.clone(), wallet);
            for address in addresses {
                data.addresses.insert(address.address.clone(), address);
            }
            for output in unspent {
                data.unspents.insert(output.outpoint.to_string(), output);
            }
            for symbol in symbols {
                data.bump_revision(&wallet_id, &symbol);
            }
            Ok(())
        })
        .await?;
        info!("[{}] Imported wallet {}", self.app_id, wallet_id);
        Ok(())
    }

    // ---- addresses ----

    /// Persist new addresses; all or nothing.
    ///
    /// Fails with `DuplicateAddress` when an address is already stored and
    /// with `AddressIndexTaken` when its wallet already has an address at
    /// the same asset, branch and index.
    pub async fn save_addresses(&self, addresses: Vec<Address>) -> Result<usize> {
        let count = addresses.len();
        self.commit(|data| {
            let mut taken: BTreeSet<(String, String, bool, u32)> = data
                .addresses
                .values()
                .map(|a| (a.wallet_id.clone(), a.symbol.clone(), a.is_change, a.index))
                .collect();

            for address in &addresses {
                if !data.wallets.contains_key(&address.wallet_id) {
                    return Err(Error::WalletNotFound(address.wallet_id.clone()));
                }
                if let Some(existing) = data.addresses.get(&address.address) {
                    return Err(Error::DuplicateAddress {
                        address: address.address.clone(),
                        owner: existing.wallet_id.clone(),
                    });
                }
                let slot = (
                    address.wallet_id.clone(),
                    address.symbol.clone(),
                    address.is_change,
                    address.index,
                );
                if !taken.insert(slot) {
                    return Err(Error::AddressIndexTaken {
                        wallet_id: address.wallet_id.clone(),
                        hd_path: address.hd_path.clone(),
                    });
                }
            }

            for address in addresses {
                data.addresses.insert(address.address.clone(), address);
            }
            Ok(count)
        })
        .await
    }

    pub async fn get_address(&self, address: &str) -> Result<Address> {
        self.read(|data| data.addresses.get(address).cloned())
            .await?
            .ok_or_else(|| Error::AddressNotFound(address.to_string()))
    }

    /// Addresses of a wallet ordered by asset, change flag and index
    pub async fn list_addresses(
        &self,
        wallet_id: &str,
        symbol: Option<&str>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Address>> {
        self.read(|data| {
            let mut addresses: Vec<Address> = data
                .addresses
                .values()
                .filter(|a| a.wallet_id == wallet_id)
                .filter(|a| symbol.map_or(true, |s| a.symbol == s))
                .cloned()
                .collect();
            addresses.sort_by(|a, b| {
                (&a.symbol, a.is_change, a.index).cmp(&(&b.symbol, b.is_change, b.index))
            });
            addresses.into_iter().skip(offset).take(limit).collect()
        })
        .await
    }

    /// Every address of one asset across all wallets
    pub async fn addresses_for_symbol(&self, symbol: &str) -> Result<Vec<Address>> {
        self.read(|data| {
            data.addresses
                .values()
                .filter(|a| a.symbol == symbol)
                .cloned()
                .collect()
        })
        .await
    }

    pub(crate) async fn wallet_address_strings(&self, wallet_id: &str, symbol: &str) -> Result<Vec<String>> {
        self.read(|data| {
            data.addresses
                .values()
                .filter(|a| a.wallet_id == wallet_id && a.symbol == symbol)
                .map(|a| a.address.clone())
                .collect()
        })
        .await
    }

    // ---- unspent outputs ----

    /// Local unspent outputs of a wallet, ordered by id
    pub async fn list_unspent(&self, wallet_id: &str, symbol: &str) -> Result<Vec<UnspentOutput>> {
        self.read(|data| {
            data.unspents
                .values()
                .filter(|u| u.wallet_id == wallet_id && u.symbol == symbol)
                .cloned()
                .collect()
        })
        .await
    }

    pub async fn balance_summary(&self, wallet_id: &str, symbol: &str) -> Result<BalanceSummary> {
        self.read(|data| {
            let wallet = data
                .wallets
                .get(wallet_id)
                .ok_or_else(|| Error::WalletNotFound(wallet_id.to_string()))?;
            let outputs: Vec<&UnspentOutput> = data
                .unspents
                .values()
                .filter(|u| u.wallet_id == wallet_id && u.symbol == symbol)
                .collect();
            let pending = outputs
                .iter()
                .filter(|u| u.is_pending())
                .fold(0u128, |acc, u| acc.saturating_add(u.amount));
            Ok(BalanceSummary {
                wallet_id: wallet_id.to_string(),
                symbol: symbol.to_string(),
                balance: wallet.balance(symbol),
                pending,
                unspent_count: outputs.len(),
            })
        })
        .await?
    }

    /// Current change counter of a wallet's asset
    pub async fn wallet_revision(&self, wallet_id: &str, symbol: &str) -> Result<u64> {
        self.read(|data| {
            if data.wallets.contains_key(wallet_id) {
                Ok(data.revision(wallet_id, symbol))
            } else {
                Err(Error::WalletNotFound(wallet_id.to_string()))
            }
        })
        .await?
    }

    /// Reserve outputs consumed by a broadcast transaction
    pub async fn mark_pending_spend(&self, outpoints: &[OutPoint], tx_id: &str) -> Result<usize> {
        self.commit(|data| {
            let mut touched = BTreeSet::new();
            let mut marked = 0;
            for outpoint in outpoints {
                if let Some(output) = data.unspents.get_mut(&outpoint.to_string()) {
                    output.state = SpendState::PendingSpend {
                        tx_id: tx_id.to_string(),
                    };
                    touched.insert((output.wallet_id.clone(), output.symbol.clone()));
                    marked += 1;
                }
            }
            for (wallet_id, symbol) in touched {
                data.bump_revision(&wallet_id, &symbol);
            }
            Ok(marked)
        })
        .await
    }

    /// Apply the parts of a scan result that belong to this application.
    ///
    /// Returns the number of deposits and spends applied. A transaction is
    /// applied at most once; redeliveries after a restart or a deep rescan
    /// return 0.
    pub async fn apply_extract_result(&self, result: &ExtractResult, model: ChainModel) -> Result<usize> {
        if !result.success {
            debug!(
                "[{}] Ignoring failed {} tx {}: {:?}",
                self.app_id, result.symbol, result.tx_id, result.reason
            );
            return Ok(0);
        }

        let wallets = self
            .read(|data| {
                result
                    .recharges
                    .iter()
                    .filter(|r| r.source_key == self.app_id)
                    .map(|r| r.address.as_str())
                    .chain(
                        result
                            .spent
                            .iter()
                            .filter(|s| s.source_key == self.app_id)
                            .map(|s| s.address.as_str()),
                    )
                    .filter_map(|a| data.addresses.get(a).map(|a| a.wallet_id.clone()))
                    .collect::<BTreeSet<String>>()
            })
            .await?;

        if wallets.is_empty() {
            return Ok(0);
        }

        // Sorted acquisition
        let mut guards = Vec::with_capacity(wallets.len());
        for wallet_id in &wallets {
            guards.push(self.lock_wallet(wallet_id).await);
        }

        let key = applied_key(&result.symbol, &result.tx_id);
        let applied = self
            .commit(|data| {
                if data.applied.contains_key(&key) {
                    return Ok(0);
                }
                let mut applied = 0;

                for recharge in result.recharges.iter().filter(|r| r.source_key == self.app_id) {
                    let Some(owner) = data.addresses.get(&recharge.address).map(|a| a.wallet_id.clone()) else {
                        continue;
                    };
                    match model {
                        ChainModel::Utxo => {
                            let outpoint = recharge.outpoint();
                            data.unspents
                                .entry(outpoint.to_string())
                                .or_insert_with(|| UnspentOutput {
                                    outpoint,
                                    address: recharge.address.clone(),
                                    wallet_id: owner.clone(),
                                    symbol: recharge.symbol.clone(),
                                    amount: recharge.amount,
                                    block_height: Some(recharge.block_height),
                                    confirmations: 1,
                                    state: SpendState::Unspent,
                                });
                        }
                        ChainModel::Account => {
                            if let Some(address) = data.addresses.get_mut(&recharge.address) {
                                credit(address, recharge.token.as_deref(), recharge.amount);
                            }
                        }
                    }
                    data.bump_revision(&owner, &recharge.symbol);
                    applied += 1;
                }

                for spent in result.spent.iter().filter(|s| s.source_key == self.app_id) {
                    let Some(owner) = data.addresses.get(&spent.address).map(|a| a.wallet_id.clone()) else {
                        continue;
                    };
                    match (&spent.prev_out, model) {
                        (Some(prev_out), ChainModel::Utxo) => {
                            data.unspents.remove(&prev_out.to_string());
                        }
                        _ => {
                            if let Some(address) = data.addresses.get_mut(&spent.address) {
                                debit(address, spent.token.as_deref(), spent.amount);
                            }
                        }
                    }
                    data.bump_revision(&owner, &spent.symbol);
                    applied += 1;
                }

                for wallet_id in &wallets {
                    data.recompute_balances(wallet_id, &result.symbol, model);
                }
                if applied > 0 {
                    data.applied.insert(key, result.block_height);
                }
                Ok(applied)
            })
            .await?;

        drop(guards);

        if applied > 0 {
            debug!(
                "[{}] Applied {} entries from {} tx {} at block {}",
                self.app_id, applied, result.symbol, result.tx_id, result.block_height
            );
        } else {
            debug!(
                "[{}] {} tx {} already applied, skipping",
                self.app_id, result.symbol, result.tx_id
            );
        }
        Ok(applied)
    }
}

fn credit(address: &mut Address, token: Option<&str>, amount: Amount) {
    match token {
        None => address.balance = address.balance.saturating_add(amount),
        Some(token) => {
            let balance = address.token_balances.entry(token.to_string()).or_insert(0);
            *balance = balance.saturating_add(amount);
        }
    }
}

fn debit(address: &mut Address, token: Option<&str>, amount: Amount) {
    match token {
        None => address.balance = address.balance.saturating_sub(amount),
        Some(token) => {
            let balance = address.token_balances.entry(token.to_string()).or_insert(0);
            *balance = balance.saturating_sub(amount);
        }
    }
}

/// Write through a temporary file and rename over `path`
async fn write_atomic(path: &Path, data: &LedgerData) -> Result<()> {
    let json = serde_json::to_string_pretty(data)?;
    let tmp = path.with_extension("db.tmp");
    tokio::fs::write(&tmp, json)
        .await
        .map_err(|e| Error::Persistence(format!("{}: {}", tmp.display(), e)))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| Error::Persistence(format!("{}: {}", path.display(), e)))?;
    Ok(())
}
