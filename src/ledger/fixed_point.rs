//! Integer-scaled monetary amounts
//!
//! Amounts are held as `i128` nano-units (10^-9). Summing thousands of small
//! deltas in `f64` drifts; summing integers does not.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Sub};

pub const SCALE: i128 = 1_000_000_000;
pub const DECIMALS: u32 = 9;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FixedAmount(i128);

impl FixedAmount {
    pub const ZERO: FixedAmount = FixedAmount(0);

    /// Scale, round half away from zero
    pub fn from_f64(value: f64) -> Self {
        if !value.is_finite() {
            return Self::ZERO;
        }
        Self((value * SCALE as f64).round() as i128)
    }

    pub fn from_raw(raw: i128) -> Self {
        Self(raw)
    }

    /// Lamports share the 9-decimal scale
    pub fn from_lamports(lamports: u64) -> Self {
        Self(lamports as i128)
    }

    /// Token amount in base units with `decimals` places; `None` when the
    /// decimals are too large to scale
    pub fn from_base_units(amount: u64, decimals: u8) -> Option<Self> {
        let d = decimals as u32;
        if d <= DECIMALS {
            Some(Self((amount as i128) * 10i128.pow(DECIMALS - d)))
        } else {
            Some(Self((amount as i128) / 10i128.checked_pow(d - DECIMALS)?))
        }
    }

    pub fn raw(&self) -> i128 {
        self.0
    }

    pub fn to_f64(&self) -> f64 {
        self.0 as f64 / SCALE as f64
    }

    /// Base units for a token with `decimals` places, truncating; `None` if negative or too large
    pub fn to_base_units(&self, decimals: u8) -> Option<u64> {
        let d = decimals as u32;
        let units = if d >= DECIMALS {
            self.0.checked_mul(10i128.checked_pow(d - DECIMALS)?)?
        } else {
            self.0 / 10i128.pow(DECIMALS - d)
        };
        u64::try_from(units).ok()
    }

    pub fn to_lamports(&self) -> Option<u64> {
        self.to_base_units(DECIMALS as u8)
    }

    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }

    pub fn saturating_add(self, other: Self) -> Self {
        Self(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }

    /// `self * percent / 100`, rounded to the nearest nano-unit
    pub fn mul_percent(&self, percent: f64) -> Self {
        let bp = (percent * 1_000_000.0).round() as i128;
        let product = self.0.saturating_mul(bp);
        let denom = 100 * 1_000_000;
        let rounded = if product >= 0 {
            (product + denom / 2) / denom
        } else {
            (product - denom / 2) / denom
        };
        Self(rounded)
    }

    /// Multiply by a price, e.g. token amount to quote value
    pub fn mul_price(&self, price: f64) -> Self {
        Self::from_f64(self.to_f64() * price)
    }
}

impl Add for FixedAmount {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        self.saturating_add(rhs)
    }
}

impl AddAssign for FixedAmount {
    fn add_assign(&mut self, rhs: Self) {
        *self = self.saturating_add(rhs);
    }
}

impl Sub for FixedAmount {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        self.saturating_sub(rhs)
    }
}

impl fmt::Display for FixedAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let scale = SCALE as u128;
        write!(f, "{}{}.{:09}", sign, abs / scale, abs % scale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_drift_over_many_additions() {
        let step = FixedAmount::from_f64(0.1);
        let mut total = FixedAmount::ZERO;
        let mut float_total = 0.0f64;
        for _ in 0..10_000 {
            total += step;
            float_total += 0.1;
        }
        assert_eq!(total, FixedAmount::from_f64(1_000.0));
        assert_ne!(float_total, 1_000.0);
    }

    #[test]
    fn test_percent_of_balance() {
        let balance = FixedAmount::from_f64(10.0);
        assert_eq!(balance.mul_percent(2.0), FixedAmount::from_f64(0.2));
        assert_eq!(balance.mul_percent(0.5), FixedAmount::from_f64(0.05));
    }

    #[test]
    fn test_base_unit_conversions() {
        let a = FixedAmount::from_base_units(1_500_000, 6).unwrap();
        assert_eq!(a, FixedAmount::from_f64(1.5));
        assert_eq!(a.to_base_units(6), Some(1_500_000));
        assert_eq!(FixedAmount::from_lamports(42).to_lamports(), Some(42));
        assert_eq!(FixedAmount::from_f64(-1.0).to_lamports(), None);
    }

    #[test]
    fn test_oversized_decimals_do_not_overflow() {
        assert_eq!(FixedAmount::from_base_units(1, 60), None);
        assert_eq!(FixedAmount::from_base_units(10_000_000_000, 19), Some(FixedAmount::from_raw(1)));
        assert_eq!(FixedAmount::from_f64(1.0).to_base_units(60), None);
        assert_eq!(FixedAmount::from_raw(1).to_base_units(40), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(FixedAmount::from_f64(0.2).to_string(), "0.200000000");
        assert_eq!(FixedAmount::from_f64(-3.5).to_string(), "-3.500000000");
    }
}
