//! Amount units and exact conversion to base units
//!
//! Conversion is integer-only: a decimal amount is accepted when it is
//! exactly representable in base units, and rejected otherwise.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::Amount;

/// Ether denominations, each a fixed power of ten of wei
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    Wei,
    Kwei,
    Mwei,
    Gwei,
    Microether,
    Milliether,
    Ether,
}

impl Unit {
    pub const ALL: [Unit; 7] = [
        Unit::Wei,
        Unit::Kwei,
        Unit::Mwei,
        Unit::Gwei,
        Unit::Microether,
        Unit::Milliether,
        Unit::Ether,
    ];

    /// Power of ten relative to the base unit
    pub fn decimals(&self) -> u32 {
        match self {
            Unit::Wei => 0,
            Unit::Kwei => 3,
            Unit::Mwei => 6,
            Unit::Gwei => 9,
            Unit::Microether => 12,
            Unit::Milliether => 15,
            Unit::Ether => 18,
        }
    }

    /// Base units in one of this unit
    pub fn scale(&self) -> Amount {
        10u128.pow(self.decimals())
    }

    /// Convert a decimal string in this unit to base units
    pub fn to_base_units(&self, value: &str) -> Result<Amount> {
        parse_amount(value, self.decimals())
    }
}

impl FromStr for Unit {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "wei" => Ok(Unit::Wei),
            "kwei" | "babbage" => Ok(Unit::Kwei),
            "mwei" | "lovelace" => Ok(Unit::Mwei),
            "gwei" | "shannon" => Ok(Unit::Gwei),
            "microether" | "szabo" => Ok(Unit::Microether),
            "milliether" | "finney" => Ok(Unit::Milliether),
            "ether" | "eth" => Ok(Unit::Ether),
            other => Err(Error::InvalidAmount(format!("Unknown unit: {}", other))),
        }
    }
}

impl std::fmt::Display for Unit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Unit::Wei => write!(f, "wei"),
            Unit::Kwei => write!(f, "kwei"),
            Unit::Mwei => write!(f, "mwei"),
            Unit::Gwei => write!(f, "gwei"),
            Unit::Microether => write!(f, "microether"),
            Unit::Milliether => write!(f, "milliether"),
            Unit::Ether => write!(f, "ether"),
        }
    }
}

/// Parse a non-negative decimal string into base units with `decimals` fractional digits
pub fn parse_amount(value: &str, decimals: u32) -> Result<Amount> {
    let value = value.trim();
    if value.is_empty() {
        return Err(Error::InvalidAmount("empty amount".to_string()));
    }

    let (whole, fraction) = match value.split_once('.') {
        Some((w, f)) => (w, f),
        None => (value, ""),
    };

    if whole.is_empty() && fraction.is_empty() {
        return Err(Error::InvalidAmount(format!("not a number: {}", value)));
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !fraction.chars().all(|c| c.is_ascii_digit()) {
        return Err(Error::InvalidAmount(format!("not a number: {}", value)));
    }

    // Trailing zeros never lose precision
    let fraction = fraction.trim_end_matches('0');
    if fraction.len() > decimals as usize {
        return Err(Error::InvalidAmount(format!(
            "{} has more than {} decimal places",
            value, decimals
        )));
    }

    let overflow = || Error::InvalidAmount(format!("amount too large: {}", value));
    let scale = 10u128.checked_pow(decimals).ok_or_else(overflow)?;

    let whole_units: u128 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| overflow())?
    };

    let fraction_units: u128 = if fraction.is_empty() {
        0
    } else {
        let padding = 10u128
            .checked_pow(decimals - fraction.len() as u32)
            .ok_or_else(overflow)?;
        let digits: u128 = fraction.parse().map_err(|_| overflow())?;
        digits.checked_mul(padding).ok_or_else(overflow)?
    };

    whole_units
        .checked_mul(scale)
        .and_then(|w| w.checked_add(fraction_units))
        .ok_or_else(overflow)
}

/// Render base units as a decimal string with `decimals` fractional digits.
///
/// Scales beyond `u128` render the raw base-unit amount.
pub fn format_amount(amount: Amount, decimals: u32) -> String {
    if decimals == 0 {
        return amount.to_string();
    }
    let Some(scale) = 10u128.checked_pow(decimals) else {
        return amount.to_string();
    };
    let whole = amount / scale;
    let fraction = amount % scale;
    if fraction == 0 {
        return whole.to_string();
    }
    let fraction = format!("{:0width$}", fraction, width = decimals as usize);
    format!("{}.{}", whole, fraction.trim_end_matches('0'))
}
