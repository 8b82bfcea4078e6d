use std::collections::HashMap;
use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// How a copier's order amount is derived from a master fill.
///
/// Exactly one rule governs a relationship; the value travels with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "value", rename_all = "snake_case")]
pub enum SizingRule {
    /// Master fill amount × value. Valid range 0.01–2.0.
    Multiplier(Decimal),
    /// Fixed USD notional per copied fill. At least 10.
    FixedUsd(Decimal),
    /// Percentage (1–100) of the copier's available balance.
    BalancePercent(Decimal),
}

impl SizingRule {
    /// Build a rule from the stored method name and value.
    pub fn from_parts(method: &str, value: Decimal) -> Result<Self, RelationshipError> {
        let rule = match method.to_lowercase().as_str() {
            "multiplier" => SizingRule::Multiplier(value),
            "fixed_usd" => SizingRule::FixedUsd(value),
            "balance_percent" => SizingRule::BalancePercent(value),
            other => return Err(RelationshipError::UnknownSizingMethod(other.to_string())),
        };
        rule.validate()?;
        Ok(rule)
    }

    pub fn method(&self) -> &'static str {
        match self {
            SizingRule::Multiplier(_) => "multiplier",
            SizingRule::FixedUsd(_) => "fixed_usd",
            SizingRule::BalancePercent(_) => "balance_percent",
        }
    }

    pub fn value(&self) -> Decimal {
        match self {
            SizingRule::Multiplier(v) | SizingRule::FixedUsd(v) | SizingRule::BalancePercent(v) => *v,
        }
    }

    pub fn needs_balance(&self) -> bool {
        matches!(self, SizingRule::BalancePercent(_))
    }

    pub fn validate(&self) -> Result<(), RelationshipError> {
        let (value, min, max) = match *self {
            SizingRule::Multiplier(v) => (v, Decimal::new(1, 2), Some(Decimal::TWO)),
            SizingRule::FixedUsd(v) => (v, Decimal::TEN, None),
            SizingRule::BalancePercent(v) => (v, Decimal::ONE, Some(Decimal::ONE_HUNDRED)),
        };
        if value < min || max.is_some_and(|m| value > m) {
            return Err(RelationshipError::SizingOutOfRange {
                method: self.method(),
                value,
            });
        }
        Ok(())
    }
}

impl fmt::Display for SizingRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.method(), self.value())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RelationshipError {
    #[error("unknown sizing method: {0}")]
    UnknownSizingMethod(String),

    #[error("{method} value {value} is out of range")]
    SizingOutOfRange { method: &'static str, value: Decimal },

    #[error("leverage cap {0} is outside 1-50")]
    LeverageOutOfRange(i64),

    #[error("{field} must be positive, got {value}")]
    NonPositiveLimit { field: &'static str, value: Decimal },
}

/// A copier account following one master wallet, with its sizing and risk rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyRelationship {
    pub id: Uuid,
    pub copier_wallet: String,
    pub master_wallet: String,
    /// Opaque ciphertext; only the credential vault can read it.
    #[serde(skip_serializing)]
    pub encrypted_credential: String,
    pub sizing: SizingRule,
    pub max_position_usd: Option<Decimal>,
    pub symbol_filter: Vec<String>,
    pub max_leverage: Option<u32>,
    pub max_total_exposure: Option<Decimal>,
    pub symbol_multipliers: HashMap<String, Decimal>,
    pub active: bool,
}

impl CopyRelationship {
    pub fn new(
        copier_wallet: impl Into<String>,
        master_wallet: impl Into<String>,
        encrypted_credential: impl Into<String>,
        sizing: SizingRule,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            copier_wallet: copier_wallet.into(),
            master_wallet: master_wallet.into(),
            encrypted_credential: encrypted_credential.into(),
            sizing,
            max_position_usd: None,
            symbol_filter: Vec::new(),
            max_leverage: None,
            max_total_exposure: None,
            symbol_multipliers: HashMap::new(),
            active: true,
        }
    }

    /// Empty allow-list means every symbol is copied. Comparison is case-insensitive.
    pub fn allows_symbol(&self, symbol: &str) -> bool {
        self.symbol_filter.is_empty()
            || self
                .symbol_filter
                .iter()
                .any(|s| s.eq_ignore_ascii_case(symbol))
    }

    pub fn symbol_multiplier(&self, symbol: &str) -> Option<Decimal> {
        self.symbol_multipliers
            .iter()
            .find(|(s, _)| s.eq_ignore_ascii_case(symbol))
            .map(|(_, m)| *m)
    }

    pub fn validate(&self) -> Result<(), RelationshipError> {
        self.sizing.validate()?;

        if let Some(lev) = self.max_leverage {
            if !(1..=50).contains(&lev) {
                return Err(RelationshipError::LeverageOutOfRange(lev as i64));
            }
        }
        for (field, limit) in [
            ("max_position_usd", self.max_position_usd),
            ("max_total_exposure", self.max_total_exposure),
        ] {
            if let Some(value) = limit {
                if value <= Decimal::ZERO {
                    return Err(RelationshipError::NonPositiveLimit { field, value });
                }
            }
        }
        Ok(())
    }
}
