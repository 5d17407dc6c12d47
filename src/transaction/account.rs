//! Transfers on account-model chains
//!
//! No coin selection: a single sending address must hold the amount, plus
//! the fee when the fee is paid in the same coin.

use chrono::Utc;
use uuid::Uuid;

use super::builder::{PlannedOutput, Recipient, TransactionBuilder, UnsignedTransaction};
use super::fee::FeeRate;
use crate::assets::{ChainModel, TokenContract};
use crate::error::{Error, Result};
use crate::ledger::types::Address;
use crate::Amount;

fn spendable(address: &Address, token: Option<&TokenContract>) -> Amount {
    match token {
        None => address.balance,
        Some(token) => address.token_balances.get(&token.address).copied().unwrap_or(0),
    }
}

impl TransactionBuilder {
    /// First address able to cover the transfer, richest first
    pub fn select_account_source<'a>(
        &self,
        addresses: &'a [Address],
        amount: Amount,
        fee: Amount,
        token: Option<&TokenContract>,
    ) -> Result<&'a Address> {
        let mut candidates: Vec<&Address> = addresses.iter().collect();
        candidates.sort_by(|a, b| {
            spendable(b, token)
                .cmp(&spendable(a, token))
                .then_with(|| a.address.cmp(&b.address))
        });

        let required = match token {
            None => amount.saturating_add(fee),
            Some(_) => amount,
        };

        candidates
            .iter()
            .find(|a| spendable(a, token) >= required && (token.is_none() || a.balance >= fee))
            .copied()
            .ok_or_else(|| Error::InsufficientFunds {
                available: candidates.first().map(|a| spendable(a, token)).unwrap_or(0),
                required,
            })
    }

    /// Transfer from one account address
    pub fn build_account_transfer(
        &self,
        wallet_id: &str,
        from: &Address,
        recipient: Recipient,
        fee_rate: FeeRate,
        token: Option<&TokenContract>,
    ) -> Result<UnsignedTransaction> {
        self.validate_recipients(std::slice::from_ref(&recipient))?;

        let fee = self.estimate_fee(1, 1, fee_rate);
        match token {
            None => {
                let required = recipient
                    .amount
                    .checked_add(fee)
                    .ok_or_else(|| Error::InvalidAmount("amount plus fee overflows".to_string()))?;
                if from.balance < required {
                    return Err(Error::InsufficientFunds {
                        available: from.balance,
                        required,
                    });
                }
            }
            Some(token) => {
                let available = spendable(from, Some(token));
                if available < recipient.amount {
                    return Err(Error::InsufficientFunds {
                        available,
                        required: recipient.amount,
                    });
                }
                if from.balance < fee {
                    return Err(Error::InsufficientFunds {
                        available: from.balance,
                        required: fee,
                    });
                }
            }
        }

        Ok(UnsignedTransaction {
            request_id: Uuid::new_v4().to_string(),
            symbol: self.symbol().to_string(),
            wallet_id: wallet_id.to_string(),
            inputs: Vec::new(),
            from_address: Some(from.address.clone()),
            token: token.cloned(),
            outputs: vec![PlannedOutput {
                address: recipient.address,
                amount: recipient.amount,
                is_change: false,
            }],
            fee,
            fee_rate,
            created_at: Utc::now(),
        })
    }

    /// Whether this builder's asset uses account transfers
    pub fn is_account_model(&self) -> bool {
        self.model() == ChainModel::Account
    }
}
