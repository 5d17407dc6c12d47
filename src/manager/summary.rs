//! Balance collection
//!
//! Registered wallets are swept to a configured collection address on a
//! timer. UTXO wallets move every spendable output in one transaction;
//! account wallets transfer each address's balance above the threshold,
//! tokens first.

use futures::FutureExt;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{SendReceipt, WalletManager};
use crate::assets::{ChainModel, TokenContract};
use crate::error::{Error, Result};
use crate::scanner::ScanTask;
use crate::transaction::{FeeRate, Recipient, TransactionBuilder};
use crate::Amount;

/// Parsed collection target for one asset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryPolicy {
    pub symbol: String,
    pub address: String,
    /// Balances below this stay where they are
    pub threshold: Amount,
    pub fee_rate: FeeRate,
    pub tokens: Vec<(TokenContract, Amount)>,
}

/// Wallet enrolled in a periodic sweep
#[derive(Clone)]
pub(crate) struct SummaryWallet {
    pub app_id: String,
    pub wallet_id: String,
    pub password: String,
}

impl WalletManager {
    /// Collection policy for `symbol` from the `[summary]` configuration
    pub fn summary_policy(&self, symbol: &str) -> Result<SummaryPolicy> {
        let adapter = self.adapter(symbol)?;
        let target = self
            .config
            .summary
            .target(adapter.symbol())
            .ok_or_else(|| Error::Config(format!("summary address for {} is not set", adapter.symbol())))?;
        if !adapter.validate_address(&target.address) {
            return Err(Error::InvalidRecipient(target.address.clone()));
        }

        let builder = TransactionBuilder::new(adapter.clone(), &self.config.transaction);
        let threshold = builder.parse_amount(&target.threshold, None)?;
        let tokens = target
            .tokens
            .iter()
            .map(|t| {
                let contract = TokenContract {
                    symbol: t.symbol.clone(),
                    address: t.address.clone(),
                    decimals: t.decimals,
                };
                let threshold = builder.parse_amount(&t.threshold, Some(&contract))?;
                Ok((contract, threshold))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(SummaryPolicy {
            symbol: adapter.symbol().to_string(),
            address: target.address.clone(),
            threshold,
            fee_rate: FeeRate::per_byte(Amount::from(target.fee_rate)),
            tokens,
        })
    }

    /// Sweep one wallet according to `policy`, returning the broadcast transfers
    pub async fn summary_wallet(
        &self,
        app_id: &str,
        wallet_id: &str,
        password: &str,
        policy: &SummaryPolicy,
    ) -> Result<Vec<SendReceipt>> {
        let adapter = self.adapter(&policy.symbol)?;
        let builder = TransactionBuilder::new(adapter.clone(), &self.config.transaction);
        let store = self.open_db(app_id).await?;
        let wallet = store.get_wallet(wallet_id).await?;
        let symbol = adapter.symbol().to_string();

        let _guard = store.lock_wallet(wallet_id).await;
        let mut receipts = Vec::new();

        match adapter.model() {
            ChainModel::Utxo => {
                let unspent = store.list_unspent(wallet_id, &symbol).await?;
                let tip = adapter.current_height().await.ok();
                let available = builder.spendable_total(&unspent, tip);
                if available == 0 || available < policy.threshold {
                    debug!(
                        "[{}] {} wallet {} holds {} spendable, below threshold {}",
                        app_id, symbol, wallet_id, available, policy.threshold
                    );
                    return Ok(receipts);
                }

                let unsigned =
                    match builder.build_sweep_transaction(wallet_id, &unspent, &policy.address, policy.fee_rate, tip) {
                        Ok(unsigned) => unsigned,
                        Err(Error::InsufficientFunds { available, required }) => {
                            debug!(
                                "[{}] {} wallet {} cannot cover a sweep: {} available, {} required",
                                app_id, symbol, wallet_id, available, required
                            );
                            return Ok(receipts);
                        }
                        Err(e) => return Err(e),
                    };

                let tx_id = self.sign_and_broadcast(&wallet, &unsigned, password).await?;
                store.mark_pending_spend(&unsigned.outpoints(), &tx_id).await?;
                receipts.push(SendReceipt {
                    tx_id,
                    symbol: symbol.clone(),
                    wallet_id: wallet_id.to_string(),
                    fee: unsigned.fee,
                    transaction: unsigned,
                });
            }
            ChainModel::Account => {
                let addresses = store
                    .list_addresses(wallet_id, Some(&symbol), 0, usize::MAX)
                    .await?;
                let fee = builder.estimate_fee(1, 1, policy.fee_rate);
                // Gas for a token sweep comes out of the native balance
                let mut paid_gas: BTreeSet<&str> = BTreeSet::new();

                for (token, threshold) in &policy.tokens {
                    for address in addresses.iter().filter(|a| a.address != policy.address) {
                        let balance = address.token_balances.get(&token.address).copied().unwrap_or(0);
                        if balance == 0 || balance < *threshold || paid_gas.contains(address.address.as_str()) {
                            continue;
                        }
                        let recipient = Recipient::new(policy.address.clone(), balance);
                        let sent = match builder.build_account_transfer(
                            wallet_id,
                            address,
                            recipient,
                            policy.fee_rate,
                            Some(token),
                        ) {
                            Ok(unsigned) => self
                                .sign_and_broadcast(&wallet, &unsigned, password)
                                .await
                                .map(|tx_id| (tx_id, unsigned)),
                            Err(e) => Err(e),
                        };
                        match sent {
                            Ok((tx_id, unsigned)) => {
                                paid_gas.insert(address.address.as_str());
                                receipts.push(SendReceipt {
                                    tx_id,
                                    symbol: symbol.clone(),
                                    wallet_id: wallet_id.to_string(),
                                    fee: unsigned.fee,
                                    transaction: unsigned,
                                });
                            }
                            Err(e) => warn!(
                                "[{}] {} sweep from {} failed: {}",
                                app_id, token.symbol, address.address, e
                            ),
                        }
                    }
                }

                for address in addresses.iter().filter(|a| a.address != policy.address) {
                    if paid_gas.contains(address.address.as_str())
                        || address.balance < policy.threshold
                        || address.balance <= fee
                    {
                        continue;
                    }
                    let recipient = Recipient::new(policy.address.clone(), address.balance - fee);
                    let sent = match builder.build_account_transfer(wallet_id, address, recipient, policy.fee_rate, None) {
                        Ok(unsigned) => self
                            .sign_and_broadcast(&wallet, &unsigned, password)
                            .await
                            .map(|tx_id| (tx_id, unsigned)),
                        Err(e) => Err(e),
                    };
                    match sent {
                        Ok((tx_id, unsigned)) => receipts.push(SendReceipt {
                            tx_id,
                            symbol: symbol.clone(),
                            wallet_id: wallet_id.to_string(),
                            fee: unsigned.fee,
                            transaction: unsigned,
                        }),
                        Err(e) => warn!("[{}] {} sweep from {} failed: {}", app_id, symbol, address.address, e),
                    }
                }
            }
        }

        if !receipts.is_empty() {
            info!(
                "[{}] Swept wallet {} to {}: {} {} transfers",
                app_id,
                wallet_id,
                policy.address,
                receipts.len(),
                symbol
            );
        }
        Ok(receipts)
    }

    /// Enroll a wallet in the sweep of `symbol`; re-adding replaces the password
    pub async fn add_summary_wallet(&self, symbol: &str, app_id: &str, wallet_id: &str, password: &str) -> Result<()> {
        let symbol = self.adapter(symbol)?.symbol().to_string();
        self.get_wallet(app_id, wallet_id).await?;

        let mut enrolled = self.summary_wallets.lock().unwrap_or_else(|e| e.into_inner());
        let wallets = enrolled.entry(symbol.clone()).or_default();
        wallets.retain(|w| !(w.app_id == app_id && w.wallet_id == wallet_id));
        wallets.push(SummaryWallet {
            app_id: app_id.to_string(),
            wallet_id: wallet_id.to_string(),
            password: password.to_string(),
        });
        info!("[{}] Wallet {} enrolled in {} summary", app_id, wallet_id, symbol);
        Ok(())
    }

    pub fn remove_summary_wallet(&self, symbol: &str, app_id: &str, wallet_id: &str) -> bool {
        let mut enrolled = self.summary_wallets.lock().unwrap_or_else(|e| e.into_inner());
        let Some(wallets) = enrolled
            .iter_mut()
            .find(|(key, _)| key.eq_ignore_ascii_case(symbol))
            .map(|(_, wallets)| wallets)
        else {
            return false;
        };
        let before = wallets.len();
        wallets.retain(|w| !(w.app_id == app_id && w.wallet_id == wallet_id));
        wallets.len() != before
    }

    fn enrolled_wallets(&self, symbol: &str) -> Vec<SummaryWallet> {
        self.summary_wallets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(symbol)
            .cloned()
            .unwrap_or_default()
    }

    /// One sweep over every enrolled wallet. A failing wallet is logged and skipped.
    pub async fn run_summary(&self, symbol: &str) -> Result<Vec<SendReceipt>> {
        let policy = self.summary_policy(symbol)?;
        let mut receipts = Vec::new();
        for wallet in self.enrolled_wallets(&policy.symbol) {
            match self
                .summary_wallet(&wallet.app_id, &wallet.wallet_id, &wallet.password, &policy)
                .await
            {
                Ok(sent) => receipts.extend(sent),
                Err(e) => warn!(
                    "[{}] {} summary of wallet {} failed: {}",
                    wallet.app_id, policy.symbol, wallet.wallet_id, e
                ),
            }
        }
        Ok(receipts)
    }

    /// Sweep enrolled wallets every `summary.period_secs`.
    ///
    /// Fails when no collection address is configured or nothing is enrolled.
    pub fn start_summary(self: &Arc<Self>, symbol: &str) -> Result<()> {
        let policy = self.summary_policy(symbol)?;
        if self.enrolled_wallets(&policy.symbol).is_empty() {
            return Err(Error::Config(format!("no wallets enrolled in {} summary", policy.symbol)));
        }

        let mut tasks = self.summary_tasks.lock().unwrap_or_else(|e| e.into_inner());
        if tasks.contains_key(&policy.symbol) {
            debug!("{} summary already running", policy.symbol);
            return Ok(());
        }

        let weak = Arc::downgrade(self);
        let task_symbol = policy.symbol.clone();
        let task = ScanTask::new(self.config.summary.period(), move || {
            let weak = weak.clone();
            let symbol = task_symbol.clone();
            async move {
                let Some(manager) = weak.upgrade() else {
                    return;
                };
                match manager.run_summary(&symbol).await {
                    Ok(receipts) if !receipts.is_empty() => {
                        info!("{} summary broadcast {} transfers", symbol, receipts.len())
                    }
                    Ok(_) => {}
                    Err(e) => warn!("{} summary failed: {}", symbol, e),
                }
            }
            .boxed()
        });
        task.start();
        info!(
            "{} summary started, every {:?} to {}",
            policy.symbol,
            self.config.summary.period(),
            policy.address
        );
        tasks.insert(policy.symbol, Arc::new(task));
        Ok(())
    }

    /// Stop the periodic sweep of `symbol`, waiting for an in-flight run
    pub async fn stop_summary(&self, symbol: &str) {
        let task = {
            let mut tasks = self.summary_tasks.lock().unwrap_or_else(|e| e.into_inner());
            let key = tasks.keys().find(|k| k.eq_ignore_ascii_case(symbol)).cloned();
            key.and_then(|k| tasks.remove(&k))
        };
        if let Some(task) = task {
            task.stop().await;
            info!("{} summary stopped", symbol);
        }
    }

    pub fn summary_running(&self, symbol: &str) -> bool {
        self.summary_tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .any(|k| k.eq_ignore_ascii_case(symbol))
    }
}
