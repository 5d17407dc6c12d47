//! Fee estimation
//!
//! Fees are a pure function of input count, output count and fee rate.
//! Nothing here touches the network, so callers can estimate
//! speculatively before any inputs are reserved.

use serde::{Deserialize, Serialize};

use crate::Amount;

/// Fee rate in base units per byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FeeRate(pub u128);

impl FeeRate {
    pub const ZERO: FeeRate = FeeRate(0);

    pub fn per_byte(rate: u128) -> Self {
        Self(rate)
    }

    /// Fee for a transaction of `size` bytes, saturating on overflow
    pub fn fee_for_size(&self, size: u64) -> Amount {
        (size as u128).saturating_mul(self.0)
    }
}

impl std::fmt::Display for FeeRate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/byte", self.0)
    }
}

/// Linear transaction size model: `base + inputs * per_input + outputs * per_output`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeModel {
    /// Version, lock time and count prefixes
    pub base: u64,
    /// One signed input
    pub per_input: u64,
    /// One output
    pub per_output: u64,
}

impl Default for SizeModel {
    /// P2PKH sizes
    fn default() -> Self {
        Self {
            base: 10,
            per_input: 148,
            per_output: 34,
        }
    }
}

impl SizeModel {
    /// Estimated serialized size in bytes
    pub fn estimated_size(&self, input_count: usize, output_count: usize) -> u64 {
        self.base
            .saturating_add(self.per_input.saturating_mul(input_count as u64))
            .saturating_add(self.per_output.saturating_mul(output_count as u64))
    }

    /// Estimated fee for the given shape
    pub fn estimate_fee(&self, input_count: usize, output_count: usize, fee_rate: FeeRate) -> Amount {
        fee_rate.fee_for_size(self.estimated_size(input_count, output_count))
    }
}

/// Estimate a fee with the default size model
pub fn estimate_fee(input_count: usize, output_count: usize, fee_rate: FeeRate) -> Amount {
    SizeModel::default().estimate_fee(input_count, output_count, fee_rate)
}
