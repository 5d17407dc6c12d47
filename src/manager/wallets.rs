//! Wallet, address and transfer operations

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::WalletManager;
use crate::assets::{ChainModel, KeyMaterial, TokenContract};
use crate::error::{Error, Result};
use crate::ledger::{Address, BalanceSummary, RebuildReport, UnspentOutput, Wallet};
use crate::transaction::{FeeRate, Recipient, TransactionBuilder, UnsignedTransaction};
use crate::Amount;

/// Outcome of a broadcast transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    pub tx_id: String,
    pub symbol: String,
    pub wallet_id: String,
    pub fee: Amount,
    pub transaction: UnsignedTransaction,
}

impl WalletManager {
    // ---- wallets ----

    /// Register a wallet whose keys were generated externally.
    ///
    /// The encrypted key file is expected under the configured key directory.
    pub async fn create_wallet(&self, app_id: &str, alias: &str, root_pub: &str) -> Result<Wallet> {
        let store = self.open_db(app_id).await?;
        let wallet_id = Uuid::new_v4().simple().to_string();
        let key_file = self
            .config
            .manager
            .key_dir
            .join(format!("{}-{}.key", alias, wallet_id));
        store
            .create_wallet(Wallet::new(wallet_id, alias, root_pub, key_file))
            .await
    }

    pub async fn get_wallet(&self, app_id: &str, wallet_id: &str) -> Result<Wallet> {
        self.open_db(app_id).await?.get_wallet(wallet_id).await
    }

    pub async fn list_wallets(&self, app_id: &str) -> Result<Vec<Wallet>> {
        self.open_db(app_id).await?.list_wallets().await
    }

    // ---- addresses ----

    /// Derive `count` new addresses and start watching them.
    ///
    /// Paths follow `<hd_root_path>/<change>/<index>`, continuing after the
    /// highest index already stored for that branch. Concurrent calls for one
    /// wallet are serialized.
    pub async fn create_address(
        &self,
        app_id: &str,
        wallet_id: &str,
        symbol: &str,
        count: u32,
        is_change: bool,
    ) -> Result<Vec<Address>> {
        let adapter = self.adapter(symbol)?;
        let store = self.open_db(app_id).await?;
        let wallet = store.get_wallet(wallet_id).await?;
        let symbol = adapter.symbol().to_string();

        // Index allocation and insert happen under one guard
        let _guard = store.lock_wallet(wallet_id).await;
        let start = store
            .list_addresses(wallet_id, Some(&symbol), 0, usize::MAX)
            .await?
            .iter()
            .filter(|a| a.is_change == is_change)
            .map(|a| a.index + 1)
            .max()
            .unwrap_or(0);

        let root = adapter.hd_root_path();
        let branch = if is_change { 1 } else { 0 };
        let mut addresses = Vec::with_capacity(count as usize);
        for index in start..start.saturating_add(count) {
            let hd_path = format!("{}/{}/{}", root, branch, index);
            let address = adapter.derive_address(&wallet, &hd_path)?;
            addresses.push(Address {
                address,
                wallet_id: wallet_id.to_string(),
                symbol: symbol.clone(),
                hd_path,
                index,
                is_change,
                balance: 0,
                token_balances: Default::default(),
                created_at: chrono::Utc::now(),
            });
        }

        store.save_addresses(addresses.clone()).await?;

        if let Some(scanner) = adapter.block_scanner() {
            for address in &addresses {
                scanner.add_address(address.address.clone(), app_id);
            }
        }

        info!(
            "[{}] Created {} {} addresses for wallet {}",
            app_id,
            addresses.len(),
            symbol,
            wallet_id
        );
        Ok(addresses)
    }

    pub async fn list_addresses(
        &self,
        app_id: &str,
        wallet_id: &str,
        symbol: Option<&str>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Address>> {
        let store = self.open_db(app_id).await?;
        store.get_wallet(wallet_id).await?;
        store.list_addresses(wallet_id, symbol, offset, limit).await
    }

    // ---- balances ----

    pub async fn list_unspent(&self, app_id: &str, wallet_id: &str, symbol: &str) -> Result<Vec<UnspentOutput>> {
        let store = self.open_db(app_id).await?;
        store.get_wallet(wallet_id).await?;
        store.list_unspent(wallet_id, symbol).await
    }

    pub async fn balance_summary(&self, app_id: &str, wallet_id: &str, symbol: &str) -> Result<BalanceSummary> {
        self.open_db(app_id).await?.balance_summary(wallet_id, symbol).await
    }

    /// Replace the wallet's local unspent set with the chain's
    pub async fn rebuild_wallet_unspent(&self, app_id: &str, wallet_id: &str, symbol: &str) -> Result<RebuildReport> {
        let adapter = self.adapter(symbol)?;
        let store = self.open_db(app_id).await?;
        store.rebuild_wallet_unspent(wallet_id, adapter.as_ref()).await
    }

    /// Refresh cached account balances, tokens included
    pub async fn refresh_wallet_balance(
        &self,
        app_id: &str,
        wallet_id: &str,
        symbol: &str,
        tokens: &[TokenContract],
    ) -> Result<Amount> {
        let adapter = self.adapter(symbol)?;
        let store = self.open_db(app_id).await?;
        store
            .refresh_wallet_balance(wallet_id, adapter.as_ref(), tokens)
            .await
    }

    // ---- transfers ----

    pub fn transaction_builder(&self, symbol: &str) -> Result<TransactionBuilder> {
        Ok(TransactionBuilder::new(
            self.adapter(symbol)?,
            &self.config.transaction,
        ))
    }

    /// Fee for a transaction of the given shape on `symbol`
    pub fn estimate_fee(&self, symbol: &str, input_count: usize, output_count: usize, fee_rate: FeeRate) -> Result<Amount> {
        Ok(self
            .transaction_builder(symbol)?
            .estimate_fee(input_count, output_count, fee_rate))
    }

    pub async fn send_transaction(
        &self,
        app_id: &str,
        wallet_id: &str,
        symbol: &str,
        recipient: Recipient,
        password: &str,
        fee_rate: FeeRate,
    ) -> Result<SendReceipt> {
        self.send_batch_transaction(app_id, wallet_id, symbol, vec![recipient], password, fee_rate)
            .await
    }

    /// Build, sign and broadcast one transaction paying every recipient.
    ///
    /// Selected outputs are reserved only after a successful broadcast. The
    /// wallet stays locked from selection to reservation, so concurrent sends
    /// never pick the same outputs.
    pub async fn send_batch_transaction(
        &self,
        app_id: &str,
        wallet_id: &str,
        symbol: &str,
        recipients: Vec<Recipient>,
        password: &str,
        fee_rate: FeeRate,
    ) -> Result<SendReceipt> {
        let adapter = self.adapter(symbol)?;
        let builder = TransactionBuilder::new(adapter.clone(), &self.config.transaction);
        let store = self.open_db(app_id).await?;
        let wallet = store.get_wallet(wallet_id).await?;
        let symbol = adapter.symbol().to_string();

        let _guard = store.lock_wallet(wallet_id).await;
        let addresses = store
            .list_addresses(wallet_id, Some(&symbol), 0, usize::MAX)
            .await?;

        let unsigned = match adapter.model() {
            ChainModel::Utxo => {
                let unspent = store.list_unspent(wallet_id, &symbol).await?;
                let change_address = addresses
                    .iter()
                    .find(|a| a.is_change)
                    .or_else(|| addresses.first())
                    .map(|a| a.address.clone())
                    .ok_or_else(|| Error::AddressNotFound(format!("no {} address in {}", symbol, wallet_id)))?;
                let tip = adapter.current_height().await.ok();

                builder.build_batch_transaction(wallet_id, &unspent, &recipients, &change_address, fee_rate, tip)?
            }
            ChainModel::Account => {
                let [recipient] = <[Recipient; 1]>::try_from(recipients).map_err(|_| {
                    Error::InvalidRecipient(format!("{} transfers take exactly one recipient", symbol))
                })?;
                build_account_unsigned(&builder, &addresses, wallet_id, recipient, fee_rate, None)?
            }
        };

        let tx_id = self.sign_and_broadcast(&wallet, &unsigned, password).await?;

        if !unsigned.inputs.is_empty() {
            store.mark_pending_spend(&unsigned.outpoints(), &tx_id).await?;
        }

        info!(
            "[{}] Sent {} tx {} from {} ({} outputs, fee {})",
            app_id,
            symbol,
            tx_id,
            wallet_id,
            unsigned.outputs.len(),
            unsigned.fee
        );

        Ok(SendReceipt {
            tx_id,
            symbol,
            wallet_id: wallet_id.to_string(),
            fee: unsigned.fee,
            transaction: unsigned,
        })
    }

    /// Transfer a token on an account-model chain
    pub async fn send_token_transaction(
        &self,
        app_id: &str,
        wallet_id: &str,
        symbol: &str,
        token: &TokenContract,
        recipient: Recipient,
        password: &str,
        fee_rate: FeeRate,
    ) -> Result<SendReceipt> {
        let adapter = self.adapter(symbol)?;
        if adapter.model() != ChainModel::Account {
            return Err(Error::UnsupportedAsset(format!("{} has no token transfers", symbol)));
        }
        let builder = TransactionBuilder::new(adapter.clone(), &self.config.transaction);
        let store = self.open_db(app_id).await?;
        let wallet = store.get_wallet(wallet_id).await?;

        let _guard = store.lock_wallet(wallet_id).await;
        let addresses = store
            .list_addresses(wallet_id, Some(adapter.symbol()), 0, usize::MAX)
            .await?;

        let unsigned =
            build_account_unsigned(&builder, &addresses, wallet_id, recipient, fee_rate, Some(token))?;
        let tx_id = self.sign_and_broadcast(&wallet, &unsigned, password).await?;

        info!(
            "[{}] Sent {} {} tx {} from {}",
            app_id,
            token.symbol,
            adapter.symbol(),
            tx_id,
            wallet_id
        );

        Ok(SendReceipt {
            tx_id,
            symbol: adapter.symbol().to_string(),
            wallet_id: wallet_id.to_string(),
            fee: unsigned.fee,
            transaction: unsigned,
        })
    }

    pub(super) async fn sign_and_broadcast(
        &self,
        wallet: &Wallet,
        unsigned: &UnsignedTransaction,
        password: &str,
    ) -> Result<String> {
        let adapter = self.adapter(&unsigned.symbol)?;
        let key = KeyMaterial {
            wallet_id: wallet.wallet_id.clone(),
            key_file: wallet.key_file.clone(),
            password: password.to_string(),
        };
        let signed = adapter.sign_transaction(unsigned, &key).await?;
        adapter.broadcast_transaction(&signed).await
    }
}

fn build_account_unsigned(
    builder: &TransactionBuilder,
    addresses: &[Address],
    wallet_id: &str,
    recipient: Recipient,
    fee_rate: FeeRate,
    token: Option<&TokenContract>,
) -> Result<UnsignedTransaction> {
    let fee = builder.estimate_fee(1, 1, fee_rate);
    let source = builder.select_account_source(addresses, recipient.amount, fee, token)?;
    builder.build_account_transfer(wallet_id, source, recipient, fee_rate, token)
}

#[cfg(test)]
mod tests {
    use crate::assets::AssetRegistry;
    use crate::error::{Error, ErrorCategory};
    use crate::ledger::SpendState;
    use crate::manager::WalletManager;
    use crate::test_utils::{pay, remote_unspent, test_config, MockChain};
    use crate::transaction::{FeeRate, Recipient};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dir: TempDir,
        btc: Arc<MockChain>,
        eth: Arc<MockChain>,
        manager: Arc<WalletManager>,
        wallet_id: String,
    }

    async fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let btc = MockChain::utxo("BTC");
        let eth = MockChain::account("ETH");
        let registry = AssetRegistry::new().with(btc.adapter()).with(eth.adapter());
        let manager = WalletManager::new(test_config(dir.path()), registry);
        let wallet = manager.create_wallet("app1", "main", "xpub-main").await.unwrap();
        Fixture {
            _dir: dir,
            btc,
            eth,
            manager,
            wallet_id: wallet.wallet_id,
        }
    }

    #[tokio::test]
    async fn test_create_address_paths_and_registration() {
        let f = fixture().await;
        let first = f
            .manager
            .create_address("app1", &f.wallet_id, "btc", 2, false)
            .await
            .unwrap();
        let more = f
            .manager
            .create_address("app1", &f.wallet_id, "BTC", 1, false)
            .await
            .unwrap();
        let change = f
            .manager
            .create_address("app1", &f.wallet_id, "BTC", 1, true)
            .await
            .unwrap();

        assert_eq!(first[0].hd_path, "m/44'/0'/0'/0/0");
        assert_eq!(first[1].hd_path, "m/44'/0'/0'/0/1");
        assert_eq!(more[0].hd_path, "m/44'/0'/0'/0/2");
        assert_eq!(change[0].hd_path, "m/44'/0'/0'/1/0");

        for address in first.iter().chain(&more).chain(&change) {
            assert!(f.btc.scanner().is_exist_address(&address.address));
        }

        let page = f
            .manager
            .list_addresses("app1", &f.wallet_id, Some("BTC"), 0, 2)
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_wallet() {
        let f = fixture().await;
        let err = f
            .manager
            .create_address("app1", "missing", "BTC", 1, false)
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::NotFound);
    }

    async fn funded_btc(f: &Fixture, amounts: &[u128]) -> Vec<String> {
        let addresses = f
            .manager
            .create_address("app1", &f.wallet_id, "BTC", amounts.len() as u32, false)
            .await
            .unwrap();
        let remote = addresses
            .iter()
            .zip(amounts)
            .enumerate()
            .map(|(i, (a, amount))| remote_unspent(&format!("fund{}", i), 0, &a.address, *amount, 6))
            .collect();
        f.btc.backend().set_unspent(remote);
        f.manager
            .rebuild_wallet_unspent("app1", &f.wallet_id, "BTC")
            .await
            .unwrap();
        addresses.into_iter().map(|a| a.address).collect()
    }

    #[tokio::test]
    async fn test_send_batch_reserves_after_broadcast() {
        let f = fixture().await;
        funded_btc(&f, &[100_000, 40_000]).await;

        let receipt = f
            .manager
            .send_batch_transaction(
                "app1",
                &f.wallet_id,
                "BTC",
                vec![Recipient::new("dest1", 30_000), Recipient::new("dest2", 20_000)],
                "secret",
                FeeRate::per_byte(2),
            )
            .await
            .unwrap();

        assert_eq!(f.btc.backend().broadcasts().len(), 1);
        assert_eq!(receipt.transaction.outputs[0].address, "dest1");
        assert_eq!(receipt.transaction.outputs[1].address, "dest2");

        let unspent = f.manager.list_unspent("app1", &f.wallet_id, "BTC").await.unwrap();
        let pending: Vec<_> = unspent.iter().filter(|u| u.is_pending()).collect();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].amount, 100_000);
        assert_eq!(
            pending[0].state,
            SpendState::PendingSpend {
                tx_id: receipt.tx_id.clone()
            }
        );
    }

    #[tokio::test]
    async fn test_concurrent_sends_do_not_share_outputs() {
        let f = fixture().await;
        funded_btc(&f, &[100_000]).await;
        f.btc.backend().set_sign_delay(Duration::from_millis(50));

        let send = |dest: &'static str| {
            let manager = f.manager.clone();
            let wallet_id = f.wallet_id.clone();
            tokio::spawn(async move {
                manager
                    .send_transaction(
                        "app1",
                        &wallet_id,
                        "BTC",
                        Recipient::new(dest, 10_000),
                        "secret",
                        FeeRate::per_byte(1),
                    )
                    .await
            })
        };
        let (first, second) = tokio::join!(send("dest1"), send("dest2"));
        let results = [first.unwrap(), second.unwrap()];

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(Error::InsufficientFunds { .. }))));
        assert_eq!(f.btc.backend().broadcasts().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_address_creation_uses_distinct_indices() {
        let f = fixture().await;
        let (a, b) = tokio::join!(
            f.manager.create_address("app1", &f.wallet_id, "BTC", 2, false),
            f.manager.create_address("app1", &f.wallet_id, "BTC", 2, false),
        );
        let mut indices: Vec<u32> = a.unwrap().iter().chain(&b.unwrap()).map(|a| a.index).collect();
        indices.sort();
        assert_eq!(indices, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_failed_broadcast_reserves_nothing() {
        let f = fixture().await;
        funded_btc(&f, &[100_000]).await;
        f.btc.backend().fail_broadcast(true);

        let err = f
            .manager
            .send_transaction(
                "app1",
                &f.wallet_id,
                "BTC",
                Recipient::new("dest", 10_000),
                "secret",
                FeeRate::per_byte(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Broadcast(_)));

        let unspent = f.manager.list_unspent("app1", &f.wallet_id, "BTC").await.unwrap();
        assert!(unspent.iter().all(|u| !u.is_pending()));
    }

    #[tokio::test]
    async fn test_wrong_password_fails_signing() {
        let f = fixture().await;
        funded_btc(&f, &[100_000]).await;

        let err = f
            .manager
            .send_transaction(
                "app1",
                &f.wallet_id,
                "BTC",
                Recipient::new("dest", 10_000),
                "wrong",
                FeeRate::per_byte(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Signing(_)));
        assert!(f.btc.backend().broadcasts().is_empty());
    }

    #[tokio::test]
    async fn test_insufficient_funds_reserves_nothing() {
        let f = fixture().await;
        funded_btc(&f, &[1_000]).await;

        let err = f
            .manager
            .send_transaction(
                "app1",
                &f.wallet_id,
                "BTC",
                Recipient::new("dest", 10_000),
                "secret",
                FeeRate::per_byte(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientFunds { .. }));
        assert!(f.btc.backend().broadcasts().is_empty());
    }

    #[tokio::test]
    async fn test_deposit_then_spend_round_trip() {
        let f = fixture().await;
        let addresses = f
            .manager
            .create_address("app1", &f.wallet_id, "BTC", 1, false)
            .await
            .unwrap();
        f.manager.init().await.unwrap();
        f.btc.scanner().pause();

        f.btc.backend().push_block(vec![pay("dep", &addresses[0].address, 60_000)]);
        f.btc.scanner().scan_cycle().await.unwrap();

        let summary = f
            .manager
            .balance_summary("app1", &f.wallet_id, "BTC")
            .await
            .unwrap();
        assert_eq!(summary.balance, 60_000);

        f.manager
            .send_transaction(
                "app1",
                &f.wallet_id,
                "BTC",
                Recipient::new("dest", 10_000),
                "secret",
                FeeRate::per_byte(1),
            )
            .await
            .unwrap();

        let summary = f
            .manager
            .balance_summary("app1", &f.wallet_id, "BTC")
            .await
            .unwrap();
        assert_eq!(summary.available(), 0);

        f.manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_account_transfer() {
        let f = fixture().await;
        let addresses = f
            .manager
            .create_address("app1", &f.wallet_id, "ETH", 2, false)
            .await
            .unwrap();
        f.eth.backend().set_balance(&addresses[1].address, None, 1_000_000);
        f.manager
            .refresh_wallet_balance("app1", &f.wallet_id, "ETH", &[])
            .await
            .unwrap();

        let receipt = f
            .manager
            .send_transaction(
                "app1",
                &f.wallet_id,
                "ETH",
                Recipient::new("0xdest", 500_000),
                "secret",
                FeeRate::per_byte(10),
            )
            .await
            .unwrap();

        assert_eq!(
            receipt.transaction.from_address.as_deref(),
            Some(addresses[1].address.as_str())
        );
        assert_eq!(receipt.fee, 210_000);

        let err = f
            .manager
            .send_batch_transaction(
                "app1",
                &f.wallet_id,
                "ETH",
                vec![Recipient::new("0xd1", 1), Recipient::new("0xd2", 1)],
                "secret",
                FeeRate::per_byte(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRecipient(_)));
    }

    #[tokio::test]
    async fn test_estimate_fee() {
        let f = fixture().await;
        assert_eq!(
            f.manager.estimate_fee("BTC", 1, 2, FeeRate::per_byte(1)).unwrap(),
            226
        );
        assert!(f.manager.estimate_fee("DOGE", 1, 2, FeeRate::per_byte(1)).is_err());
    }
}
