//! Transaction construction
//!
//! Turns a wallet's local unspent view and a list of recipients into an
//! [`UnsignedTransaction`]. Nothing is reserved here; outputs are only
//! marked pending after the signed transaction has been broadcast.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use super::coin_selection::CoinSelector;
use super::fee::{FeeRate, SizeModel};
use super::units::{format_amount, parse_amount};
use crate::assets::{AssetAdapter, ChainModel, TokenContract};
use crate::config::TransactionConfig;
use crate::error::{Error, Result};
use crate::ledger::types::{OutPoint, UnspentOutput};
use crate::Amount;

/// Payment to one address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub address: String,
    pub amount: Amount,
}

impl Recipient {
    pub fn new(address: impl Into<String>, amount: Amount) -> Self {
        Self {
            address: address.into(),
            amount,
        }
    }
}

/// Output of an unsigned transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedOutput {
    pub address: String,
    pub amount: Amount,
    #[serde(default)]
    pub is_change: bool,
}

/// Transaction ready to hand to an adapter for signing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedTransaction {
    pub request_id: String,
    pub symbol: String,
    pub wallet_id: String,
    /// Selected outputs (UTXO chains)
    #[serde(default)]
    pub inputs: Vec<UnspentOutput>,
    /// Sending address (account chains)
    #[serde(default)]
    pub from_address: Option<String>,
    /// Token being transferred (account chains)
    #[serde(default)]
    pub token: Option<TokenContract>,
    /// Recipients in request order, then change
    pub outputs: Vec<PlannedOutput>,
    pub fee: Amount,
    pub fee_rate: FeeRate,
    pub created_at: DateTime<Utc>,
}

impl UnsignedTransaction {
    pub fn outpoints(&self) -> Vec<OutPoint> {
        self.inputs.iter().map(|u| u.outpoint.clone()).collect()
    }

    pub fn input_total(&self) -> Amount {
        self.inputs.iter().fold(0u128, |acc, u| acc.saturating_add(u.amount))
    }

    /// Sum paid to recipients, change excluded
    pub fn recipient_total(&self) -> Amount {
        self.outputs
            .iter()
            .filter(|o| !o.is_change)
            .fold(0u128, |acc, o| acc.saturating_add(o.amount))
    }

    pub fn change(&self) -> Option<&PlannedOutput> {
        self.outputs.iter().find(|o| o.is_change)
    }
}

/// Builds transactions for one asset
pub struct TransactionBuilder {
    adapter: Arc<dyn AssetAdapter>,
    selector: CoinSelector,
}

impl TransactionBuilder {
    pub fn new(adapter: Arc<dyn AssetAdapter>, config: &TransactionConfig) -> Self {
        let size_model = adapter.size_model().unwrap_or(config.size_model);
        let selector = CoinSelector::new(size_model)
            .with_dust_threshold(Amount::from(config.dust_threshold))
            .with_min_confirmations(config.min_confirmations);
        Self { adapter, selector }
    }

    pub fn symbol(&self) -> &str {
        self.adapter.symbol()
    }

    pub fn model(&self) -> ChainModel {
        self.adapter.model()
    }

    pub fn size_model(&self) -> SizeModel {
        self.selector.size_model()
    }

    /// Decimal places of the native asset, or of `token` when given
    pub fn decimals(&self, token: Option<&TokenContract>) -> u32 {
        token.map_or_else(|| self.adapter.decimals(), |t| t.decimals)
    }

    /// Convert a user-entered decimal amount to base units
    pub fn parse_amount(&self, value: &str, token: Option<&TokenContract>) -> Result<Amount> {
        parse_amount(value, self.decimals(token))
    }

    pub fn format_amount(&self, amount: Amount, token: Option<&TokenContract>) -> String {
        format_amount(amount, self.decimals(token))
    }

    /// Fee for a transaction of the given shape under this asset's size model
    pub fn estimate_fee(&self, input_count: usize, output_count: usize, fee_rate: FeeRate) -> Amount {
        self.selector.size_model().estimate_fee(input_count, output_count, fee_rate)
    }

    /// Reject the batch if any recipient is malformed; returns the total amount
    pub fn validate_recipients(&self, recipients: &[Recipient]) -> Result<Amount> {
        if recipients.is_empty() {
            return Err(Error::InvalidRecipient("no recipients".to_string()));
        }

        let mut total: Amount = 0;
        for recipient in recipients {
            if !self.adapter.validate_address(&recipient.address) {
                return Err(Error::InvalidRecipient(recipient.address.clone()));
            }
            if recipient.amount == 0 {
                return Err(Error::InvalidAmount(format!(
                    "zero amount to {}",
                    recipient.address
                )));
            }
            total = total
                .checked_add(recipient.amount)
                .ok_or_else(|| Error::InvalidAmount("batch total overflows".to_string()))?;
        }
        Ok(total)
    }

    /// Single-recipient transaction
    pub fn build_transaction(
        &self,
        wallet_id: &str,
        unspent: &[UnspentOutput],
        recipient: Recipient,
        change_address: &str,
        fee_rate: FeeRate,
        tip: Option<u64>,
    ) -> Result<UnsignedTransaction> {
        self.build_batch_transaction(
            wallet_id,
            unspent,
            std::slice::from_ref(&recipient),
            change_address,
            fee_rate,
            tip,
        )
    }

    /// Pay every recipient from one set of selected inputs
    pub fn build_batch_transaction(
        &self,
        wallet_id: &str,
        unspent: &[UnspentOutput],
        recipients: &[Recipient],
        change_address: &str,
        fee_rate: FeeRate,
        tip: Option<u64>,
    ) -> Result<UnsignedTransaction> {
        let target = self.validate_recipients(recipients)?;
        if !self.adapter.validate_address(change_address) {
            return Err(Error::InvalidRecipient(format!(
                "change address {}",
                change_address
            )));
        }

        let selection = self
            .selector
            .select(unspent, target, recipients.len(), fee_rate, tip)?;

        let mut outputs: Vec<PlannedOutput> = recipients
            .iter()
            .map(|r| PlannedOutput {
                address: r.address.clone(),
                amount: r.amount,
                is_change: false,
            })
            .collect();
        if selection.has_change() {
            outputs.push(PlannedOutput {
                address: change_address.to_string(),
                amount: selection.change_amount,
                is_change: true,
            });
        }

        debug!(
            "Built {} tx for {}: {} inputs, {} outputs, fee {}",
            self.symbol(),
            wallet_id,
            selection.selected.len(),
            outputs.len(),
            selection.fee
        );

        Ok(UnsignedTransaction {
            request_id: Uuid::new_v4().to_string(),
            symbol: self.symbol().to_string(),
            wallet_id: wallet_id.to_string(),
            inputs: selection.selected,
            from_address: None,
            token: None,
            outputs,
            fee: selection.fee,
            fee_rate,
            created_at: Utc::now(),
        })
    }

    /// Sum of the outputs a build could select right now
    pub fn spendable_total(&self, unspent: &[UnspentOutput], tip: Option<u64>) -> Amount {
        self.selector
            .spendable(unspent, tip)
            .iter()
            .fold(0u128, |acc, u| acc.saturating_add(u.amount))
    }

    /// Move every spendable output to `to_address` in one transaction with no change
    pub fn build_sweep_transaction(
        &self,
        wallet_id: &str,
        unspent: &[UnspentOutput],
        to_address: &str,
        fee_rate: FeeRate,
        tip: Option<u64>,
    ) -> Result<UnsignedTransaction> {
        if !self.adapter.validate_address(to_address) {
            return Err(Error::InvalidRecipient(to_address.to_string()));
        }

        let inputs: Vec<UnspentOutput> = self
            .selector
            .spendable(unspent, tip)
            .into_iter()
            .cloned()
            .collect();
        let total = inputs.iter().fold(0u128, |acc, u| acc.saturating_add(u.amount));
        let fee = self.estimate_fee(inputs.len().max(1), 1, fee_rate);
        let amount = total.saturating_sub(fee);
        if inputs.is_empty() || amount < self.selector.dust_threshold().max(1) {
            return Err(Error::InsufficientFunds {
                available: total,
                required: fee.saturating_add(self.selector.dust_threshold().max(1)),
            });
        }

        debug!(
            "Built {} sweep for {}: {} inputs, {} to {}, fee {}",
            self.symbol(),
            wallet_id,
            inputs.len(),
            amount,
            to_address,
            fee
        );

        Ok(UnsignedTransaction {
            request_id: Uuid::new_v4().to_string(),
            symbol: self.symbol().to_string(),
            wallet_id: wallet_id.to_string(),
            inputs,
            from_address: None,
            token: None,
            outputs: vec![PlannedOutput {
                address: to_address.to_string(),
                amount,
                is_change: false,
            }],
            fee,
            fee_rate,
            created_at: Utc::now(),
        })
    }
}
