//! Fixed-point money and multiplier types.
//!
//! Balances and wagers are 2-decimal fixed point (`Amount`, cents).
//! Crash multipliers are 2-decimal fixed point as well (`Mult`, hundredths).
//! All payout math truncates toward zero so the house never pays a fraction
//! of a cent more than the declared formula.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};

/// A non-negative monetary amount in cents.
///
/// Serialized on the wire and in the ledger as a JSON number with two
/// decimals (e.g. `10.50`), which is how clients submit it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Amount(pub i64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    /// Build from whole currency units.
    pub const fn from_units(units: i64) -> Self {
        Amount(units * 100)
    }

    pub const fn from_cents(cents: i64) -> Self {
        Amount(cents)
    }

    pub fn cents(self) -> i64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    /// Multiply by a 2-decimal multiplier, truncating toward zero.
    pub fn mul_mult(self, mult: Mult) -> Amount {
        Amount((self.0 as i128 * mult.0 as i128 / 100) as i64)
    }

    /// Apply a house edge expressed in basis points, truncating the payout.
    /// `apply_edge_bps(300)` keeps 97% of the amount.
    pub fn apply_edge_bps(self, edge_bps: u32) -> Amount {
        let kept = 10_000i128 - edge_bps as i128;
        Amount((self.0 as i128 * kept / 10_000) as i64)
    }

    /// Parse a JSON-style decimal into cents. Rejects negatives, NaN and
    /// values with sub-cent precision.
    pub fn from_decimal(value: f64) -> Option<Amount> {
        if !value.is_finite() || value < 0.0 || value > 1e13 {
            return None;
        }
        let cents = (value * 100.0).round();
        if (cents / 100.0 - value).abs() > 1e-6 {
            return None;
        }
        Some(Amount(cents as i64))
    }

    pub fn to_decimal(self) -> f64 {
        self.0 as f64 / 100.0
    }
}

impl Add for Amount {
    type Output = Amount;
    fn add(self, rhs: Amount) -> Amount {
        Amount(self.0 + rhs.0)
    }
}

impl Sub for Amount {
    type Output = Amount;
    fn sub(self, rhs: Amount) -> Amount {
        Amount(self.0 - rhs.0)
    }
}

impl AddAssign for Amount {
    fn add_assign(&mut self, rhs: Amount) {
        self.0 += rhs.0;
    }
}

impl SubAssign for Amount {
    fn sub_assign(&mut self, rhs: Amount) {
        self.0 -= rhs.0;
    }
}

impl Neg for Amount {
    type Output = Amount;
    fn neg(self) -> Amount {
        Amount(-self.0)
    }
}

impl std::iter::Sum for Amount {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Amount {
        iter.fold(Amount::ZERO, |a, b| a + b)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{}{}.{:02}", sign, abs / 100, abs % 100)
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.to_decimal())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = f64::deserialize(deserializer)?;
        if !value.is_finite() || value.abs() > 1e13 {
            return Err(de::Error::custom("amount out of range"));
        }
        Ok(Amount((value * 100.0).round() as i64))
    }
}

/// A crash multiplier in hundredths (`Mult(173)` is 1.73x).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Mult(pub u32);

impl Mult {
    pub const ONE: Mult = Mult(100);

    /// Truncate a raw multiplier to two decimals. Values below 1.00 clamp up:
    /// a crash round never exposes a multiplier under 1.00.
    pub fn from_f64_truncated(value: f64) -> Mult {
        if !value.is_finite() || value <= 1.0 {
            return Mult::ONE;
        }
        let hundredths = (value * 100.0).floor();
        if hundredths >= u32::MAX as f64 {
            Mult(u32::MAX)
        } else {
            Mult(hundredths as u32)
        }
    }

    /// Parse a client-supplied multiplier (e.g. an auto-cashout target).
    /// Must be at least 1.01 with at most two decimals.
    pub fn from_decimal(value: f64) -> Option<Mult> {
        if !value.is_finite() || value < 1.01 || value > 1e6 {
            return None;
        }
        let hundredths = (value * 100.0).round();
        if (hundredths / 100.0 - value).abs() > 1e-6 {
            return None;
        }
        Some(Mult(hundredths as u32))
    }

    pub fn to_decimal(self) -> f64 {
        self.0 as f64 / 100.0
    }
}

impl fmt::Display for Mult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

impl Serialize for Mult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.to_decimal())
    }
}

impl<'de> Deserialize<'de> for Mult {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = f64::deserialize(deserializer)?;
        Mult::from_decimal(value).ok_or_else(|| de::Error::custom("invalid multiplier"))
    }
}
