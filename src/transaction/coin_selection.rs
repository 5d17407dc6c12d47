//! Coin selection for UTXO chains
//!
//! Largest outputs first, ties broken by output id, so the same ledger
//! state always yields the same selection.

use std::cmp::Reverse;

use super::fee::{FeeRate, SizeModel};
use crate::error::{Error, Result};
use crate::ledger::types::UnspentOutput;
use crate::Amount;

/// Result of a successful selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionResult {
    pub selected: Vec<UnspentOutput>,
    /// Sum of the selected outputs
    pub total_value: Amount,
    /// Sum paid to recipients
    pub target_amount: Amount,
    /// Zero when no change output is created
    pub change_amount: Amount,
    /// Includes any dust folded in when change is dropped
    pub fee: Amount,
    pub estimated_size: u64,
}

impl SelectionResult {
    pub fn has_change(&self) -> bool {
        self.change_amount > 0
    }
}

/// Picks spendable outputs covering a target plus fee
#[derive(Debug, Clone)]
pub struct CoinSelector {
    size_model: SizeModel,
    dust_threshold: Amount,
    min_confirmations: u64,
}

impl CoinSelector {
    pub fn new(size_model: SizeModel) -> Self {
        Self {
            size_model,
            dust_threshold: 546,
            min_confirmations: 1,
        }
    }

    pub fn with_dust_threshold(mut self, threshold: Amount) -> Self {
        self.dust_threshold = threshold;
        self
    }

    pub fn with_min_confirmations(mut self, confirmations: u64) -> Self {
        self.min_confirmations = confirmations;
        self
    }

    pub fn size_model(&self) -> SizeModel {
        self.size_model
    }

    pub fn dust_threshold(&self) -> Amount {
        self.dust_threshold
    }

    /// Unreserved outputs with enough confirmations, largest first
    pub fn spendable<'a>(&self, utxos: &'a [UnspentOutput], tip: Option<u64>) -> Vec<&'a UnspentOutput> {
        let mut available: Vec<&UnspentOutput> = utxos
            .iter()
            .filter(|u| !u.is_pending())
            .filter(|u| u.confirmations_at(tip) >= self.min_confirmations)
            .collect();
        available.sort_by(|a, b| {
            (Reverse(a.amount), &a.outpoint).cmp(&(Reverse(b.amount), &b.outpoint))
        });
        available
    }

    /// Select outputs paying `target_amount` to `recipient_count` outputs.
    ///
    /// A change output is planned only when the change clears the dust
    /// threshold; otherwise the remainder is left to the fee.
    pub fn select(
        &self,
        utxos: &[UnspentOutput],
        target_amount: Amount,
        recipient_count: usize,
        fee_rate: FeeRate,
        tip: Option<u64>,
    ) -> Result<SelectionResult> {
        let available = self.spendable(utxos, tip);

        let mut selected = Vec::new();
        let mut total_value: Amount = 0;

        for utxo in &available {
            total_value = total_value.saturating_add(utxo.amount);
            selected.push((*utxo).clone());

            let inputs = selected.len();
            let fee_without_change = self.size_model.estimate_fee(inputs, recipient_count, fee_rate);
            let Some(required) = target_amount.checked_add(fee_without_change) else {
                break;
            };
            if total_value < required {
                continue;
            }

            let size_with_change = self.size_model.estimated_size(inputs, recipient_count + 1);
            let fee_with_change = fee_rate.fee_for_size(size_with_change);
            let change = total_value
                .checked_sub(target_amount)
                .and_then(|v| v.checked_sub(fee_with_change))
                .unwrap_or(0);

            if change >= self.dust_threshold && change > 0 {
                return Ok(SelectionResult {
                    selected,
                    total_value,
                    target_amount,
                    change_amount: change,
                    fee: fee_with_change,
                    estimated_size: size_with_change,
                });
            }

            return Ok(SelectionResult {
                selected,
                total_value,
                target_amount,
                change_amount: 0,
                fee: total_value - target_amount,
                estimated_size: self.size_model.estimated_size(inputs, recipient_count),
            });
        }

        let available_total = available
            .iter()
            .fold(0u128, |acc, u| acc.saturating_add(u.amount));
        let required = target_amount.saturating_add(self.size_model.estimate_fee(
            available.len().max(1),
            recipient_count,
            fee_rate,
        ));
        Err(Error::InsufficientFunds {
            available: available_total,
            required,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::types::{OutPoint, SpendState};

    fn utxo(tx_id: &str, amount: Amount) -> UnspentOutput {
        UnspentOutput {
            outpoint: OutPoint::new(tx_id, 0),
            address: "A1".to_string(),
            wallet_id: "w1".to_string(),
            symbol: "BTC".to_string(),
            amount,
            block_height: Some(100),
            confirmations: 6,
            state: SpendState::Unspent,
        }
    }

    fn selector() -> CoinSelector {
        CoinSelector::new(SizeModel::default())
    }

    #[test]
    fn test_largest_first_with_change() {
        let utxos = vec![utxo("a", 10_000), utxo("b", 50_000), utxo("c", 20_000)];
        let result = selector()
            .select(&utxos, 30_000, 1, FeeRate::per_byte(10), None)
            .unwrap();

        assert_eq!(result.selected.len(), 1);
        assert_eq!(result.selected[0].outpoint.tx_id, "b");
        // 1 input, 2 outputs: 10 + 148 + 68 = 226 bytes
        assert_eq!(result.fee, 2_260);
        assert_eq!(result.change_amount, 50_000 - 30_000 - 2_260);
        assert_eq!(result.total_value, result.target_amount + result.fee + result.change_amount);
    }

    #[test]
    fn test_ties_broken_by_id() {
        let utxos = vec![utxo("z", 10_000), utxo("m", 10_000), utxo("a", 10_000)];
        let result = selector()
            .select(&utxos, 5_000, 1, FeeRate::per_byte(1), None)
            .unwrap();
        assert_eq!(result.selected[0].outpoint.tx_id, "a");
    }

    #[test]
    fn test_dust_change_is_folded_into_fee() {
        // 1 input, 1 output = 192 bytes; with change 226 bytes
        let utxos = vec![utxo("a", 10_000 + 192 + 100)];
        let result = selector()
            .select(&utxos, 10_000, 1, FeeRate::per_byte(1), None)
            .unwrap();

        assert!(!result.has_change());
        assert_eq!(result.fee, 292);
        assert_eq!(result.estimated_size, 192);
    }

    #[test]
    fn test_accumulates_multiple_inputs() {
        let utxos = vec![utxo("a", 4_000), utxo("b", 4_000), utxo("c", 4_000)];
        let result = selector()
            .select(&utxos, 7_000, 1, FeeRate::per_byte(1), None)
            .unwrap();
        assert_eq!(result.selected.len(), 2);
        assert!(result.total_value >= result.target_amount + result.fee);
    }

    #[test]
    fn test_insufficient_funds() {
        let utxos = vec![utxo("a", 1_000), utxo("b", 1_000)];
        let err = selector()
            .select(&utxos, 5_000, 1, FeeRate::per_byte(1), None)
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientFunds { available: 2_000, .. }));
    }

    #[test]
    fn test_fee_pushes_over_balance() {
        // Enough for the amount, not for amount + fee
        let utxos = vec![utxo("a", 10_000)];
        assert!(selector()
            .select(&utxos, 9_900, 1, FeeRate::per_byte(10), None)
            .is_err());
    }

    #[test]
    fn test_sufficiency_with_max_fee() {
        let rate = FeeRate::per_byte(3);
        let utxos = vec![utxo("a", 700), utxo("b", 900), utxo("c", 1_100), utxo("d", 2_500)];
        let total: Amount = utxos.iter().map(|u| u.amount).sum();
        let max_fee = SizeModel::default().estimate_fee(utxos.len(), 2, rate);
        let target = total - max_fee;

        let result = selector().select(&utxos, target, 1, rate, None).unwrap();
        assert!(result.total_value >= target + result.fee);
    }

    #[test]
    fn test_pending_and_unconfirmed_are_skipped() {
        let mut pending = utxo("a", 50_000);
        pending.state = SpendState::PendingSpend {
            tx_id: "t".to_string(),
        };
        let mut fresh = utxo("b", 50_000);
        fresh.block_height = None;
        fresh.confirmations = 0;
        let utxos = vec![pending, fresh, utxo("c", 1_000)];

        let err = selector()
            .select(&utxos, 10_000, 1, FeeRate::per_byte(1), Some(200))
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientFunds { available: 1_000, .. }));

        let lenient = selector().with_min_confirmations(0);
        assert!(lenient
            .select(&utxos, 10_000, 1, FeeRate::per_byte(1), Some(200))
            .is_ok());
    }
}
