use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::MoneyParseError;

/// Monetary value in integer minor units (cents).
///
/// All ledger arithmetic stays on integers; decimal strings only appear at
/// the user-facing boundary, where [`Money::parse_decimal`] rounds
/// half-to-even at the cent.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub const fn from_cents(cents: i64) -> Self {
        Money(cents)
    }

    pub const fn cents(self) -> i64 {
        self.0
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Money) -> Option<Money> {
        self.0.checked_add(other.0).map(Money)
    }

    pub fn checked_sub(self, other: Money) -> Option<Money> {
        self.0.checked_sub(other.0).map(Money)
    }

    pub fn saturating_add(self, other: Money) -> Money {
        Money(self.0.saturating_add(other.0))
    }

    pub fn abs(self) -> Money {
        Money(self.0.abs())
    }

    pub fn min(self, other: Money) -> Money {
        Money(self.0.min(other.0))
    }

    /// Parses a decimal string ("12", "12.3", "12.345") into cents, rounding
    /// half-to-even at the cent boundary.
    pub fn parse_decimal(input: &str) -> Result<Money, MoneyParseError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(MoneyParseError::Empty);
        }

        let (negative, rest) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };
        let (int_part, frac_part) = match rest.split_once('.') {
            Some((int_part, frac_part)) => (int_part, frac_part),
            None => (rest, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(MoneyParseError::Invalid(input.to_string()));
        }
        if !int_part.chars().all(|c| c.is_ascii_digit())
            || !frac_part.chars().all(|c| c.is_ascii_digit())
        {
            return Err(MoneyParseError::Invalid(input.to_string()));
        }

        let whole: i64 = if int_part.is_empty() {
            0
        } else {
            int_part
                .parse()
                .map_err(|_| MoneyParseError::OutOfRange)?
        };

        let mut frac = frac_part.chars();
        let tens = frac.next().and_then(|c| c.to_digit(10)).unwrap_or(0) as i64;
        let units = frac.next().and_then(|c| c.to_digit(10)).unwrap_or(0) as i64;
        let mut cents = whole
            .checked_mul(100)
            .and_then(|v| v.checked_add(tens * 10 + units))
            .ok_or(MoneyParseError::OutOfRange)?;

        // Round the sub-cent tail half-to-even.
        let tail: Vec<u32> = frac.filter_map(|c| c.to_digit(10)).collect();
        if let Some((&first, rest)) = tail.split_first() {
            let round_up = match first.cmp(&5) {
                std::cmp::Ordering::Greater => true,
                std::cmp::Ordering::Less => false,
                std::cmp::Ordering::Equal => {
                    rest.iter().any(|&d| d != 0) || cents % 2 != 0
                }
            };
            if round_up {
                cents = cents.checked_add(1).ok_or(MoneyParseError::OutOfRange)?;
            }
        }

        Ok(Money(if negative { -cents } else { cents }))
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}
