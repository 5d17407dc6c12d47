//! Reconciliation of the local ledger against the chain
//!
//! A rebuild fetches the authoritative view outside any lock, then swaps it
//! in under the wallet lock. The wallet's revision is read before the fetch
//! and checked again before the swap; a scan-driven update in between makes
//! the snapshot stale and the rebuild fails without touching local state.

use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use super::store::{revision_key, LedgerStore};
use super::types::{OutPoint, RebuildReport, SpendState, UnspentOutput};
use crate::assets::{AssetAdapter, ChainModel, RemoteUnspent, TokenContract};
use crate::error::{Error, Result};
use crate::Amount;

/// Local set after reconciliation and what changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnspentDiff {
    pub next: Vec<UnspentOutput>,
    pub inserted: Vec<OutPoint>,
    pub updated: Vec<OutPoint>,
    pub removed: Vec<OutPoint>,
    pub kept_pending: usize,
}

/// Replace `local` with `remote`, keeping reservations on outputs still unspent on chain
pub fn reconcile(
    wallet_id: &str,
    symbol: &str,
    local: &[UnspentOutput],
    remote: &[RemoteUnspent],
) -> UnspentDiff {
    let local_by_id: BTreeMap<&OutPoint, &UnspentOutput> =
        local.iter().map(|u| (&u.outpoint, u)).collect();
    let remote_by_id: BTreeMap<&OutPoint, &RemoteUnspent> =
        remote.iter().map(|r| (&r.outpoint, r)).collect();

    let mut diff = UnspentDiff::default();

    for (outpoint, remote) in &remote_by_id {
        let state = match local_by_id.get(outpoint) {
            Some(existing) => {
                if existing.amount != remote.amount
                    || existing.confirmations != remote.confirmations
                    || existing.block_height != remote.block_height
                {
                    diff.updated.push((*outpoint).clone());
                }
                if existing.is_pending() {
                    diff.kept_pending += 1;
                }
                existing.state.clone()
            }
            None => {
                diff.inserted.push((*outpoint).clone());
                SpendState::Unspent
            }
        };

        diff.next.push(UnspentOutput {
            outpoint: (*outpoint).clone(),
            address: remote.address.clone(),
            wallet_id: wallet_id.to_string(),
            symbol: symbol.to_string(),
            amount: remote.amount,
            block_height: remote.block_height,
            confirmations: remote.confirmations,
            state,
        });
    }

    diff.removed = local_by_id
        .keys()
        .filter(|outpoint| !remote_by_id.contains_key(*outpoint))
        .map(|outpoint| (*outpoint).clone())
        .collect();

    diff
}

impl LedgerStore {
    /// Replace the wallet's unspent outputs with the chain's view.
    ///
    /// Fails with `ConcurrencyConflict` when the wallet changed while the
    /// chain was queried; nothing is modified in that case.
    pub async fn rebuild_wallet_unspent(
        &self,
        wallet_id: &str,
        adapter: &dyn AssetAdapter,
    ) -> Result<RebuildReport> {
        let symbol = adapter.symbol().to_string();
        if adapter.model() != ChainModel::Utxo {
            return Err(Error::UnsupportedAsset(format!(
                "{} has no unspent outputs to rebuild",
                symbol
            )));
        }

        let revision = self.wallet_revision(wallet_id, &symbol).await?;
        let addresses = self.wallet_address_strings(wallet_id, &symbol).await?;

        let remote = if addresses.is_empty() {
            Vec::new()
        } else {
            adapter.list_unspent(&addresses).await.map_err(|e| {
                warn!(
                    "[{}] Rebuild of {} {} aborted, fetch failed: {}",
                    self.app_id(),
                    wallet_id,
                    symbol,
                    e
                );
                e
            })?
        };

        self.replace_wallet_unspent(wallet_id, &symbol, &remote, revision)
            .await
    }

    /// Swap in a fetched snapshot if the wallet is still at `expected_revision`
    pub(crate) async fn replace_wallet_unspent(
        &self,
        wallet_id: &str,
        symbol: &str,
        remote: &[RemoteUnspent],
        expected_revision: u64,
    ) -> Result<RebuildReport> {
        let _guard = self.lock_wallet(wallet_id).await;

        let report = self
            .commit(|data| {
                let current = data
                    .revisions
                    .get(&revision_key(wallet_id, symbol))
                    .copied()
                    .unwrap_or(0);
                if current != expected_revision {
                    return Err(Error::ConcurrencyConflict(wallet_id.to_string()));
                }

                let local: Vec<UnspentOutput> = data
                    .unspents
                    .values()
                    .filter(|u| u.wallet_id == wallet_id && u.symbol == symbol)
                    .cloned()
                    .collect();
                let diff = reconcile(wallet_id, symbol, &local, remote);

                data.unspents
                    .retain(|_, u| !(u.wallet_id == wallet_id && u.symbol == symbol));
                for output in diff.next {
                    data.unspents.insert(output.id(), output);
                }
                data.recompute_balances(wallet_id, symbol, ChainModel::Utxo);
                *data
                    .revisions
                    .entry(revision_key(wallet_id, symbol))
                    .or_insert(0) += 1;

                let balance = data
                    .wallets
                    .get(wallet_id)
                    .map(|w| w.balance(symbol))
                    .unwrap_or(0);

                Ok(RebuildReport {
                    wallet_id: wallet_id.to_string(),
                    symbol: symbol.to_string(),
                    inserted: diff.inserted.len(),
                    updated: diff.updated.len(),
                    removed: diff.removed.len(),
                    kept_pending: diff.kept_pending,
                    balance,
                })
            })
            .await?;

        info!(
            "[{}] Rebuilt {} {}: +{} ~{} -{} (balance {})",
            self.app_id(),
            wallet_id,
            symbol,
            report.inserted,
            report.updated,
            report.removed,
            report.balance
        );
        Ok(report)
    }

    /// Refresh cached account balances (native and tokens) from the chain.
    ///
    /// Returns the wallet's native balance afterwards.
    pub async fn refresh_wallet_balance(
        &self,
        wallet_id: &str,
        adapter: &dyn AssetAdapter,
        tokens: &[TokenContract],
    ) -> Result<Amount> {
        let symbol = adapter.symbol().to_string();
        let revision = self.wallet_revision(wallet_id, &symbol).await?;
        let addresses = self.wallet_address_strings(wallet_id, &symbol).await?;

        let mut native = Vec::with_capacity(addresses.len());
        let mut token_balances = Vec::new();
        for address in &addresses {
            native.push((address.clone(), adapter.get_balance(address, None).await?));
            for token in tokens {
                let balance = adapter.get_balance(address, Some(token)).await?;
                token_balances.push((address.clone(), token.address.clone(), balance));
            }
        }

        let _guard = self.lock_wallet(wallet_id).await;
        let total = self
            .commit(|data| {
                let key = revision_key(wallet_id, &symbol);
                if data.revisions.get(&key).copied().unwrap_or(0) != revision {
                    return Err(Error::ConcurrencyConflict(wallet_id.to_string()));
                }

                for (address, balance) in native {
                    if let Some(record) = data.addresses.get_mut(&address) {
                        record.balance = balance;
                    }
                }
                for (address, contract, balance) in token_balances {
                    if let Some(record) = data.addresses.get_mut(&address) {
                        record.token_balances.insert(contract, balance);
                    }
                }
                data.recompute_balances(wallet_id, &symbol, ChainModel::Account);
                *data.revisions.entry(key).or_insert(0) += 1;

                Ok(data
                    .wallets
                    .get(wallet_id)
                    .map(|w| w.balance(&symbol))
                    .unwrap_or(0))
            })
            .await?;

        debug!(
            "[{}] Refreshed {} balance of {}: {}",
            self.app_id(),
            symbol,
            wallet_id,
            total
        );
        Ok(total)
    }
}
