//! Discount codes applied at invoice creation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use podledger_core::DomainError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum DiscountKind {
    /// Fixed amount off, in minor units.
    Flat(u64),
    /// Whole-number percent off (1..=100).
    Percentage(u8),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscountCode {
    pub code: String,
    pub kind: DiscountKind,
    /// Smallest invoice subtotal the code applies to.
    pub min_amount: u64,
    /// Cap on the computed amount off.
    pub max_off: Option<u64>,
    pub active: bool,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
}

impl DiscountCode {
    pub fn percentage(code: impl Into<String>, percent: u8, min_amount: u64) -> Self {
        Self {
            code: code.into(),
            kind: DiscountKind::Percentage(percent),
            min_amount,
            max_off: None,
            active: true,
            starts_at: None,
            ends_at: None,
        }
    }

    pub fn flat(code: impl Into<String>, amount: u64, min_amount: u64) -> Self {
        Self {
            code: code.into(),
            kind: DiscountKind::Flat(amount),
            min_amount,
            max_off: None,
            active: true,
            starts_at: None,
            ends_at: None,
        }
    }

    /// Amount taken off `applicable`, or `InvalidDiscount` with the reason.
    ///
    /// Percentages round down. The result never exceeds `applicable`.
    pub fn amount_off(&self, applicable: u64, now: DateTime<Utc>) -> Result<u64, DomainError> {
        if !self.active {
            return Err(DomainError::InvalidDiscount(format!(
                "code {} is inactive",
                self.code
            )));
        }
        if self.starts_at.is_some_and(|start| now < start) {
            return Err(DomainError::InvalidDiscount(format!(
                "code {} is not active yet",
                self.code
            )));
        }
        if self.ends_at.is_some_and(|end| now > end) {
            return Err(DomainError::InvalidDiscount(format!(
                "code {} has expired",
                self.code
            )));
        }
        if applicable < self.min_amount {
            return Err(DomainError::InvalidDiscount(format!(
                "code {} requires a minimum of {}",
                self.code, self.min_amount
            )));
        }

        let raw = match self.kind {
            DiscountKind::Flat(amount) => amount,
            DiscountKind::Percentage(percent) => {
                if percent == 0 || percent > 100 {
                    return Err(DomainError::InvalidDiscount(format!(
                        "code {} has an invalid percentage",
                        self.code
                    )));
                }
                let off = u128::from(applicable) * u128::from(percent) / 100;
                u64::try_from(off).unwrap_or(u64::MAX)
            }
        };

        let capped = self.max_off.map_or(raw, |cap| raw.min(cap));
        Ok(capped.min(applicable))
    }
}
