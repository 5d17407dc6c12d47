//! Wallet manager
//!
//! Process-wide owner of one [`LedgerStore`] per application. Stores open
//! lazily on first use through a per-application once-cell, so concurrent
//! first access performs a single load. [`WalletManager::init`] wires every
//! supported chain's scanner to the ledger.

mod backup;
mod ledger_observer;
mod summary;
mod wallets;

use dashmap::DashMap;
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::assets::{AssetAdapter, AssetRegistry};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::ledger::LedgerStore;
use crate::scanner::{BlockScanner, Observer, ObserverHandle, ObserverRegistry, ScanTask};

use ledger_observer::LedgerObserver;
pub use backup::{WalletBackup, BACKUP_MANIFEST};
pub use summary::SummaryPolicy;
pub use wallets::SendReceipt;

lazy_static::lazy_static! {
    /// Application ids become file names
    static ref APP_ID_PATTERN: Regex =
        Regex::new(r"^[A-Za-z0-9_.-]+$").expect("Invalid app id pattern");
}

/// Check that `app_id` is usable as a database file name
pub fn validate_app_id(app_id: &str) -> Result<()> {
    if app_id.starts_with('.') || !APP_ID_PATTERN.is_match(app_id) {
        return Err(Error::InvalidAppId(app_id.to_string()));
    }
    Ok(())
}

/// Owns the per-application ledgers and the scanner wiring
pub struct WalletManager {
    config: Config,
    registry: Arc<AssetRegistry>,
    stores: DashMap<String, Arc<OnceCell<Arc<LedgerStore>>>>,
    initialized: tokio::sync::Mutex<bool>,
    /// Manager-level subscribers, notified after the ledger applied a result
    observers: ObserverRegistry,
    ledger_observer: Arc<LedgerObserver>,
    /// symbol → ledger observer subscription on that chain's scanner
    subscriptions: Mutex<HashMap<String, ObserverHandle>>,
    /// symbol → wallets swept to that asset's collection address
    summary_wallets: Mutex<HashMap<String, Vec<summary::SummaryWallet>>>,
    summary_tasks: Mutex<HashMap<String, Arc<ScanTask>>>,
}

impl WalletManager {
    pub fn new(config: Config, registry: AssetRegistry) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            config,
            registry: Arc::new(registry),
            stores: DashMap::new(),
            initialized: tokio::sync::Mutex::new(false),
            observers: ObserverRegistry::new(),
            ledger_observer: Arc::new(LedgerObserver::new(weak.clone())),
            subscriptions: Mutex::new(HashMap::new()),
            summary_wallets: Mutex::new(HashMap::new()),
            summary_tasks: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &AssetRegistry {
        &self.registry
    }

    pub fn adapter(&self, symbol: &str) -> Result<Arc<dyn AssetAdapter>> {
        self.registry.get(symbol)
    }

    /// Scanner of a registered chain
    pub fn scanner(&self, symbol: &str) -> Result<Arc<BlockScanner>> {
        self.adapter(symbol)?
            .block_scanner()
            .ok_or_else(|| Error::ScannerNotConfigured(symbol.to_string()))
    }

    // ---- store lifecycle ----

    /// Open handle for `app_id`, loading the database on first access
    pub async fn open_db(&self, app_id: &str) -> Result<Arc<LedgerStore>> {
        validate_app_id(app_id)?;

        let cell = self
            .stores
            .entry(app_id.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let db_dir = self.config.manager.db_dir.clone();
        let timeout = self.config.manager.open_timeout();
        let store = cell
            .get_or_try_init(|| async {
                let store = tokio::time::timeout(timeout, LedgerStore::open(app_id, &db_dir))
                    .await
                    .map_err(|_| Error::StoreOpenTimeout {
                        app_id: app_id.to_string(),
                        timeout_ms: self.config.manager.open_timeout_ms,
                    })??;
                Ok::<_, Error>(Arc::new(store))
            })
            .await?;

        Ok(store.clone())
    }

    /// Flush and release the handle; a later `open_db` reloads from disk
    pub async fn close_db(&self, app_id: &str) -> Result<()> {
        let Some((_, cell)) = self.stores.remove(app_id) else {
            debug!("Database {} is not open", app_id);
            return Ok(());
        };
        if let Some(store) = cell.get() {
            store.close().await?;
        }
        Ok(())
    }

    /// Application ids with an open handle
    pub fn open_app_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .stores
            .iter()
            .filter(|entry| entry.value().initialized())
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Every application with a database file, sorted
    pub async fn list_app_ids(&self) -> Result<Vec<String>> {
        list_app_ids(&self.config.manager.db_dir).await
    }

    // ---- observers ----

    /// Receive scan results after the ledger has applied them
    pub fn add_observer(&self, observer: Arc<dyn Observer>) -> ObserverHandle {
        self.observers.subscribe(observer)
    }

    pub fn remove_observer(&self, handle: ObserverHandle) -> bool {
        self.observers.unsubscribe(handle)
    }

    pub(crate) fn observers(&self) -> &ObserverRegistry {
        &self.observers
    }

    // ---- startup / shutdown ----

    /// Load all applications and start scanning every supported chain.
    ///
    /// Idempotent: later calls return immediately.
    pub async fn init(&self) -> Result<()> {
        let mut initialized = self.initialized.lock().await;
        if *initialized {
            debug!("Wallet manager already initialized");
            return Ok(());
        }

        tokio::fs::create_dir_all(&self.config.manager.db_dir).await?;
        tokio::fs::create_dir_all(&self.config.manager.key_dir).await?;
        tokio::fs::create_dir_all(self.scan_state_dir()).await?;

        let app_ids = self.list_app_ids().await?;
        info!("Loaded {} applications", app_ids.len());

        for symbol in &self.config.manager.supported_assets {
            if let Err(e) = self.init_block_scanner(symbol, &app_ids).await {
                warn!("{} block scanner not started: {}", symbol, e);
            }
        }

        *initialized = true;
        Ok(())
    }

    /// Directory holding one scan checkpoint per chain
    pub fn scan_state_dir(&self) -> PathBuf {
        self.config.manager.db_dir.join("scanner")
    }

    async fn init_block_scanner(&self, symbol: &str, app_ids: &[String]) -> Result<()> {
        let adapter = self.adapter(symbol)?;
        let scanner = adapter
            .block_scanner()
            .ok_or_else(|| Error::ScannerNotConfigured(symbol.to_string()))?;

        let checkpoint = self.scan_state_dir().join(format!("{}.json", adapter.symbol()));
        if let Err(e) = scanner.attach_checkpoint(checkpoint).await {
            warn!("{} scan progress will not be saved: {}", symbol, e);
        }

        {
            let mut subscriptions = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
            if !subscriptions.contains_key(adapter.symbol()) {
                let handle = scanner.add_observer(self.ledger_observer.clone());
                subscriptions.insert(adapter.symbol().to_string(), handle);
            }
        }

        scanner.pause();

        let mut registered = 0;
        for app_id in app_ids {
            let store = match self.open_db(app_id).await {
                Ok(store) => store,
                Err(e) => {
                    warn!("{} skipping application {}: {}", symbol, app_id, e);
                    continue;
                }
            };
            let addresses = match store.addresses_for_symbol(adapter.symbol()).await {
                Ok(addresses) => addresses,
                Err(e) => {
                    warn!("{} skipping application {}: {}", symbol, app_id, e);
                    continue;
                }
            };
            for address in addresses {
                scanner.add_address(address.address, app_id.clone());
                registered += 1;
            }
        }
        info!("{} scanner watching {} addresses", symbol, registered);

        scanner.set_scan_task();
        scanner.run()
    }

    /// Stop summary timers and scanners, detach the ledger and close every open database
    pub async fn shutdown(&self) -> Result<()> {
        let summaries: Vec<Arc<ScanTask>> = self
            .summary_tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, task)| task)
            .collect();
        for task in summaries {
            task.stop().await;
        }

        let subscriptions: Vec<(String, ObserverHandle)> = self
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        for (symbol, handle) in subscriptions {
            if let Ok(scanner) = self.scanner(&symbol) {
                scanner.stop().await;
                scanner.remove_observer(handle);
            }
        }

        let app_ids: Vec<String> = self.stores.iter().map(|e| e.key().clone()).collect();
        for app_id in app_ids {
            self.close_db(&app_id).await?;
        }
        info!("Wallet manager shut down");
        Ok(())
    }
}

async fn list_app_ids(db_dir: &Path) -> Result<Vec<String>> {
    let mut ids = Vec::new();
    let mut entries = match tokio::fs::read_dir(db_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
        Err(e) => return Err(e.into()),
    };

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("db") {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            if validate_app_id(stem).is_ok() {
                ids.push(stem.to_string());
            }
        }
    }
    ids.sort();
    Ok(ids)
}
