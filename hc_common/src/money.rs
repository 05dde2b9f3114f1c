use std::{
    fmt::Display,
    ops::{Add, AddAssign, Neg, Sub, SubAssign},
    str::FromStr,
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sqlx::Type;
use thiserror::Error;

use crate::op;

pub const CURRENCY_CODE: &str = "INR";

const MINOR_PER_MAJOR: i64 = 100;

//--------------------------------------        Money        ---------------------------------------------------------
/// A monetary amount held as an integer count of currency minor units (paise, cents).
///
/// Amounts cross the wire as decimal major units (`450`, `9.99`) and are stored as integers, so sums and
/// differences are exact.
#[derive(Debug, Clone, Copy, Default, Type, Ord, PartialOrd, PartialEq, Eq, Hash)]
#[sqlx(transparent)]
pub struct Money(i64);

op!(binary Money, Add, add);
op!(binary Money, Sub, sub);
op!(inplace Money, AddAssign, add_assign);
op!(inplace Money, SubAssign, sub_assign);
op!(unary Money, Neg, neg);

#[derive(Debug, Clone, Error)]
#[error("Value cannot be represented as a monetary amount: {0}")]
pub struct MoneyConversionError(String);

impl From<i64> for Money {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl TryFrom<f64> for Money {
    type Error = MoneyConversionError;

    /// Converts an amount in major units. Amounts finer than one minor unit are rejected rather than rounded.
    fn try_from(major: f64) -> Result<Self, Self::Error> {
        if !major.is_finite() {
            return Err(MoneyConversionError(format!("{major} is not a finite number")));
        }
        let scaled = major * MINOR_PER_MAJOR as f64;
        let minor = scaled.round();
        if minor.abs() > i64::MAX as f64 / 2.0 {
            return Err(MoneyConversionError(format!("{major} is out of range")));
        }
        // Tolerates the representation error of decimals like 9.99, not a real third decimal place
        let tolerance = (scaled.abs() * f64::EPSILON * 8.0).max(1e-6);
        if (scaled - minor).abs() > tolerance {
            return Err(MoneyConversionError(format!("{major} has more than two decimal places")));
        }
        #[allow(clippy::cast_possible_truncation)]
        Ok(Self(minor as i64))
    }
}

impl FromStr for Money {
    type Err = MoneyConversionError;

    /// Parses a decimal amount in major units, e.g. `"9.99"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let major = s.trim().parse::<f64>().map_err(|e| MoneyConversionError(format!("{s}: {e}")))?;
        Self::try_from(major)
    }
}

impl Display for Money {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02} {CURRENCY_CODE}", abs / MINOR_PER_MAJOR as u64, abs % MINOR_PER_MAJOR as u64)
    }
}

impl Serialize for Money {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.to_major())
    }
}

impl<'de> Deserialize<'de> for Money {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let major = f64::deserialize(deserializer)?;
        Money::try_from(major).map_err(serde::de::Error::custom)
    }
}

impl Money {
    pub fn value(&self) -> i64 {
        self.0
    }

    pub const fn from_minor(minor: i64) -> Self {
        Self(minor)
    }

    pub fn from_major(major: i64) -> Self {
        Self(major * MINOR_PER_MAJOR)
    }

    pub fn to_major(&self) -> f64 {
        self.0 as f64 / MINOR_PER_MAJOR as f64
    }

    pub fn checked_add(self, rhs: Money) -> Option<Money> {
        self.0.checked_add(rhs.0).map(Self)
    }

    pub fn checked_mul(self, factor: i64) -> Option<Money> {
        self.0.checked_mul(factor).map(Self)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Multiplies the amount by `rate`, rounding to the nearest minor unit.
    pub fn scale(&self, rate: f64) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        Self((self.0 as f64 * rate).round() as i64)
    }

    pub fn clamp_between(self, min: Money, max: Money) -> Self {
        // A misconfigured policy with min > max resolves to max rather than panicking
        if min > max {
            return max;
        }
        self.clamp(min, max)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn major_units_convert_exactly() {
        assert_eq!(Money::try_from(9.99).unwrap().value(), 999);
        assert_eq!(Money::try_from(500.01).unwrap().value(), 50001);
        assert_eq!(Money::try_from(0.1 + 0.2).unwrap().value(), 30);
        assert_eq!(Money::try_from(1_234_567.89).unwrap().value(), 123_456_789);
        assert!(Money::try_from(f64::NAN).is_err());
        assert_eq!("20".parse::<Money>().unwrap(), Money::from_major(20));
        assert!("twenty".parse::<Money>().is_err());
    }

    #[test]
    fn fractions_of_a_minor_unit_are_rejected() {
        assert!(Money::try_from(500.004).is_err());
        assert!(Money::try_from(9.995).is_err());
        assert!("0.001".parse::<Money>().is_err());
        assert!(serde_json::from_str::<Money>("10.005").is_err());
    }

    #[test]
    fn checked_arithmetic_reports_overflow() {
        let big = Money::from(i64::MAX / 2);
        assert_eq!(Money::from(250).checked_mul(4), Some(Money::from(1_000)));
        assert_eq!(big.checked_mul(3), None);
        assert_eq!(big.checked_add(big), Some(Money::from(i64::MAX - 1)));
        assert_eq!(big.checked_add(big).and_then(|m| m.checked_add(Money::from(2))), None);
    }

    #[test]
    fn json_uses_major_units() {
        let m: Money = serde_json::from_str("450").unwrap();
        assert_eq!(m, Money::from_major(450));
        assert_eq!(serde_json::to_string(&Money::from(999)).unwrap(), "9.99");
    }

    #[test]
    fn scale_and_clamp() {
        let total = Money::from_major(450);
        assert_eq!(total.scale(0.4), Money::from_major(180));
        let small = Money::from_major(50).scale(0.4);
        assert_eq!(small.clamp_between(Money::from_major(20), Money::from_major(500)), Money::from_major(20));
    }

    #[test]
    fn display() {
        assert_eq!(Money::from(45_050).to_string(), "450.50 INR");
        assert_eq!(Money::from(-5).to_string(), "-0.05 INR");
    }
}
