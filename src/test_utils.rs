//! In-memory chain and fixtures shared by unit tests

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::assets::{
    AssetAdapter, Block, BlockSource, ChainModel, ChainTransaction, KeyMaterial, RemoteUnspent,
    SignedTransaction, TokenContract, TxOutput,
};
use crate::config::{Config, ScannerConfig};
use crate::error::{Error, Result};
use crate::ledger::types::{Address, OutPoint, Wallet};
use crate::scanner::BlockScanner;
use crate::transaction::{SizeModel, UnsignedTransaction};
use crate::Amount;

#[derive(Default)]
struct BackendState {
    blocks: BTreeMap<u64, Block>,
    failing_fetches: u32,
    unspent: Vec<RemoteUnspent>,
    fail_list_unspent: bool,
    balances: HashMap<(String, Option<String>), Amount>,
    broadcasts: Vec<SignedTransaction>,
    fail_broadcast: bool,
    sign_delay: Option<Duration>,
}

/// Scriptable chain backend. Block 0 (`blk-0`) exists from the start and
/// every pushed block links to the current tip.
pub struct MockBackend {
    state: Mutex<BackendState>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        let mut state = BackendState::default();
        state.blocks.insert(
            0,
            Block {
                height: 0,
                hash: "blk-0".to_string(),
                prev_hash: String::new(),
                transactions: Vec::new(),
            },
        );
        Arc::new(Self {
            state: Mutex::new(state),
        })
    }

    /// Append a block on top of the tip, returning its height
    pub fn push_block(&self, transactions: Vec<ChainTransaction>) -> u64 {
        let mut state = self.state.lock().unwrap();
        let (tip, prev_hash) = state
            .blocks
            .iter()
            .next_back()
            .map(|(h, b)| (*h, b.hash.clone()))
            .unwrap();
        let height = tip + 1;
        state.blocks.insert(
            height,
            Block {
                height,
                hash: format!("blk-{}", height),
                prev_hash,
                transactions,
            },
        );
        height
    }

    /// Swap the block at `height` for a sibling with hash `blk-<height>-<tag>`
    pub fn replace_block(&self, height: u64, transactions: Vec<ChainTransaction>, tag: &str) {
        let mut state = self.state.lock().unwrap();
        let block = state.blocks.get_mut(&height).unwrap();
        block.hash = format!("blk-{}-{}", height, tag);
        block.transactions = transactions;
    }

    /// Fail the next `n` block fetches with a connection error
    pub fn fail_next_fetches(&self, n: u32) {
        self.state.lock().unwrap().failing_fetches = n;
    }

    pub fn set_unspent(&self, unspent: Vec<RemoteUnspent>) {
        self.state.lock().unwrap().unspent = unspent;
    }

    pub fn fail_list_unspent(&self, fail: bool) {
        self.state.lock().unwrap().fail_list_unspent = fail;
    }

    pub fn set_balance(&self, address: &str, token: Option<&str>, amount: Amount) {
        self.state
            .lock()
            .unwrap()
            .balances
            .insert((address.to_string(), token.map(str::to_string)), amount);
    }

    pub fn fail_broadcast(&self, fail: bool) {
        self.state.lock().unwrap().fail_broadcast = fail;
    }

    /// Make every signature take `delay`
    pub fn set_sign_delay(&self, delay: Duration) {
        self.state.lock().unwrap().sign_delay = Some(delay);
    }

    fn sign_delay(&self) -> Option<Duration> {
        self.state.lock().unwrap().sign_delay
    }

    pub fn broadcasts(&self) -> Vec<SignedTransaction> {
        self.state.lock().unwrap().broadcasts.clone()
    }

    fn list_unspent(&self, addresses: &[String]) -> Result<Vec<RemoteUnspent>> {
        let state = self.state.lock().unwrap();
        if state.fail_list_unspent {
            return Err(Error::RpcConnection("list_unspent unavailable".to_string()));
        }
        Ok(state
            .unspent
            .iter()
            .filter(|u| addresses.contains(&u.address))
            .cloned()
            .collect())
    }

    fn get_balance(&self, address: &str, token: Option<&TokenContract>) -> Amount {
        let key = (address.to_string(), token.map(|t| t.address.clone()));
        self.state
            .lock()
            .unwrap()
            .balances
            .get(&key)
            .copied()
            .unwrap_or(0)
    }

    fn broadcast(&self, tx: &SignedTransaction) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        if state.fail_broadcast {
            return Err(Error::Broadcast("rejected by node".to_string()));
        }
        state.broadcasts.push(tx.clone());
        Ok(tx.tx_id.clone())
    }
}

#[async_trait]
impl BlockSource for MockBackend {
    async fn current_height(&self) -> Result<u64> {
        let state = self.state.lock().unwrap();
        Ok(state.blocks.keys().next_back().copied().unwrap_or(0))
    }

    async fn fetch_block(&self, height: u64) -> Result<Block> {
        let mut state = self.state.lock().unwrap();
        if state.failing_fetches > 0 {
            state.failing_fetches -= 1;
            return Err(Error::RpcConnection("connection reset".to_string()));
        }
        state
            .blocks
            .get(&height)
            .cloned()
            .ok_or(Error::BlockNotFound(height))
    }
}

/// Adapter over a [`MockBackend`] with a scanner wired to it
pub struct MockChain {
    symbol: String,
    model: ChainModel,
    backend: Arc<MockBackend>,
    scanner: Arc<BlockScanner>,
}

impl MockChain {
    fn build(symbol: &str, model: ChainModel) -> Arc<Self> {
        let backend = MockBackend::new();
        let config = ScannerConfig {
            period_secs: 3_600,
            start_height: Some(1),
            retry_base_delay_ms: 1,
            ..Default::default()
        };
        let scanner = Arc::new(BlockScanner::new(symbol, backend.clone(), config));
        Arc::new(Self {
            symbol: symbol.to_string(),
            model,
            backend,
            scanner,
        })
    }

    pub fn utxo(symbol: &str) -> Arc<Self> {
        Self::build(symbol, ChainModel::Utxo)
    }

    pub fn account(symbol: &str) -> Arc<Self> {
        Self::build(symbol, ChainModel::Account)
    }

    pub fn adapter(self: &Arc<Self>) -> Arc<dyn AssetAdapter> {
        self.clone()
    }

    pub fn scanner(&self) -> Arc<BlockScanner> {
        self.scanner.clone()
    }

    pub fn backend(&self) -> Arc<MockBackend> {
        self.backend.clone()
    }
}

#[async_trait]
impl BlockSource for MockChain {
    async fn current_height(&self) -> Result<u64> {
        self.backend.current_height().await
    }

    async fn fetch_block(&self, height: u64) -> Result<Block> {
        self.backend.fetch_block(height).await
    }
}

#[async_trait]
impl AssetAdapter for MockChain {
    fn symbol(&self) -> &str {
        &self.symbol
    }

    fn model(&self) -> ChainModel {
        self.model
    }

    fn decimals(&self) -> u32 {
        match self.model {
            ChainModel::Utxo => 8,
            ChainModel::Account => 18,
        }
    }

    fn block_scanner(&self) -> Option<Arc<BlockScanner>> {
        Some(self.scanner.clone())
    }

    fn size_model(&self) -> Option<SizeModel> {
        match self.model {
            ChainModel::Utxo => None,
            ChainModel::Account => Some(SizeModel {
                base: 21_000,
                per_input: 0,
                per_output: 0,
            }),
        }
    }

    fn derive_address(&self, wallet: &Wallet, path: &str) -> Result<String> {
        Ok(format!(
            "{}-{}-{}",
            self.symbol.to_lowercase(),
            wallet.root_pub,
            path
        ))
    }

    fn validate_address(&self, address: &str) -> bool {
        !address.is_empty() && !address.contains(' ')
    }

    async fn list_unspent(&self, addresses: &[String]) -> Result<Vec<RemoteUnspent>> {
        self.backend.list_unspent(addresses)
    }

    async fn get_balance(&self, address: &str, token: Option<&TokenContract>) -> Result<Amount> {
        Ok(self.backend.get_balance(address, token))
    }

    async fn sign_transaction(
        &self,
        tx: &UnsignedTransaction,
        key: &KeyMaterial,
    ) -> Result<SignedTransaction> {
        if let Some(delay) = self.backend.sign_delay() {
            tokio::time::sleep(delay).await;
        }
        if key.password == "wrong" {
            return Err(Error::Signing(format!("cannot decrypt {}", key.key_file.display())));
        }
        Ok(SignedTransaction {
            symbol: tx.symbol.clone(),
            tx_id: format!("tx-{}", tx.request_id),
            raw: serde_json::to_string(tx)?,
        })
    }

    async fn broadcast_transaction(&self, tx: &SignedTransaction) -> Result<String> {
        self.backend.broadcast(tx)
    }
}

/// Single-output payment to `address`
pub fn pay(tx_id: &str, address: &str, amount: Amount) -> ChainTransaction {
    ChainTransaction {
        tx_id: tx_id.to_string(),
        inputs: Vec::new(),
        outputs: vec![TxOutput {
            index: 0,
            address: Some(address.to_string()),
            amount,
            token: None,
        }],
        failure: None,
    }
}

pub fn wallet(wallet_id: &str) -> Wallet {
    Wallet::new(
        wallet_id,
        format!("{}-alias", wallet_id),
        format!("xpub-{}", wallet_id),
        format!("keys/{}.key", wallet_id).into(),
    )
}

pub fn address(wallet_id: &str, symbol: &str, address: &str, index: u32) -> Address {
    Address {
        address: address.to_string(),
        wallet_id: wallet_id.to_string(),
        symbol: symbol.to_string(),
        hd_path: format!("m/44'/0'/0'/0/{}", index),
        index,
        is_change: false,
        balance: 0,
        token_balances: BTreeMap::new(),
        created_at: chrono::Utc::now(),
    }
}

pub fn remote_unspent(
    tx_id: &str,
    vout: u32,
    address: &str,
    amount: Amount,
    confirmations: u64,
) -> RemoteUnspent {
    RemoteUnspent {
        outpoint: OutPoint::new(tx_id, vout),
        address: address.to_string(),
        amount,
        confirmations,
        block_height: None,
    }
}

/// Configuration rooted in `dir`, scanning BTC and ETH
pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.manager.db_dir = dir.join("db");
    config.manager.key_dir = dir.join("key");
    config.manager.supported_assets = vec!["BTC".to_string(), "ETH".to_string()];
    config.scanner.period_secs = 3_600;
    config
}
