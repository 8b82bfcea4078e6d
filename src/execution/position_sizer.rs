use rust_decimal::Decimal;
use thiserror::Error;

use crate::models::{quantize, CopyRelationship, Fill, SizingRule};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SizingError {
    #[error("fill price must be positive, got {0}")]
    NonPositivePrice(Decimal),

    #[error("balance_percent sizing needs the copier's available balance")]
    BalanceRequired,
}

/// Amounts at each step of sizing one copy order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizedOrder {
    /// Amount straight from the sizing rule.
    pub base: Decimal,
    /// After the per-symbol multiplier and the position cap.
    pub adjusted: Decimal,
    /// `adjusted` rounded down to the lot size. May be zero.
    pub amount: Decimal,
}

/// Amount implied by the sizing rule alone.
pub fn base_amount(
    rule: &SizingRule,
    fill_amount: Decimal,
    fill_price: Decimal,
    available_balance: Option<Decimal>,
) -> Result<Decimal, SizingError> {
    if fill_price <= Decimal::ZERO {
        return Err(SizingError::NonPositivePrice(fill_price));
    }

    let amount = match *rule {
        SizingRule::Multiplier(m) => fill_amount * m,
        SizingRule::FixedUsd(usd) => usd / fill_price,
        SizingRule::BalancePercent(pct) => {
            let balance = available_balance.ok_or(SizingError::BalanceRequired)?;
            (balance * pct / Decimal::ONE_HUNDRED) / fill_price
        }
    };
    Ok(amount)
}

/// Shrink `amount` so that amount × price stays within `cap` (USD).
pub fn apply_position_cap(amount: Decimal, price: Decimal, cap: Option<Decimal>) -> Decimal {
    match cap {
        Some(cap) if price > Decimal::ZERO && amount * price > cap => cap / price,
        _ => amount,
    }
}

/// Run the sizing pipeline for one relationship: rule, per-symbol
/// multiplier, position cap, then round down to the lot size.
pub fn size_order(
    rel: &CopyRelationship,
    fill: &Fill,
    lot_size: Decimal,
    available_balance: Option<Decimal>,
) -> Result<SizedOrder, SizingError> {
    let base = base_amount(&rel.sizing, fill.amount, fill.price, available_balance)?;

    let mut adjusted = base;
    if let Some(m) = rel.symbol_multiplier(&fill.symbol) {
        adjusted *= m;
    }
    adjusted = apply_position_cap(adjusted, fill.price, rel.max_position_usd);

    Ok(SizedOrder {
        base,
        adjusted,
        amount: quantize(adjusted, lot_size).max(Decimal::ZERO),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FillKind, TradeSide};
    use chrono::Utc;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn btc_fill(amount: &str, price: &str) -> Fill {
        Fill {
            master_wallet: "Master1".into(),
            symbol: "BTC".into(),
            trade_side: TradeSide::OpenLong,
            amount: dec(amount),
            price: dec(price),
            kind: FillKind::FulfillTaker,
            received_at: Utc::now(),
        }
    }

    fn rel(rule: SizingRule) -> CopyRelationship {
        CopyRelationship::new("Copier1", "Master1", "b64:", rule)
    }

    #[test]
    fn test_multiplier_is_exact() {
        let amount = base_amount(&SizingRule::Multiplier(dec("0.37")), dec("1.234567"), dec("10"), None).unwrap();
        assert_eq!(amount, dec("1.234567") * dec("0.37"));
    }

    #[test]
    fn test_half_multiplier_rounds_down_to_lot() {
        let sized = size_order(&rel(SizingRule::Multiplier(dec("0.5"))), &btc_fill("0.002", "50000"), dec("0.001"), None)
            .unwrap();
        assert_eq!(sized.base, dec("0.001"));
        assert_eq!(sized.amount, dec("0.001"));
    }

    #[test]
    fn test_fixed_usd_divides_by_price() {
        let sized = size_order(&rel(SizingRule::FixedUsd(dec("100"))), &btc_fill("0.002", "50000"), dec("0.001"), None)
            .unwrap();
        assert_eq!(sized.base, dec("0.002"));
        assert_eq!(sized.amount, dec("0.002"));
    }

    #[test]
    fn test_balance_percent_needs_balance() {
        let rule = SizingRule::BalancePercent(dec("10"));
        assert_eq!(
            base_amount(&rule, dec("1"), dec("50000"), None),
            Err(SizingError::BalanceRequired)
        );
        // 10% of 5000 = 500 USD at 50000 → 0.01
        assert_eq!(base_amount(&rule, dec("1"), dec("50000"), Some(dec("5000"))).unwrap(), dec("0.01"));
    }

    #[test]
    fn test_position_cap_applies_to_every_rule() {
        let fill = btc_fill("0.002", "50000");
        for rule in [
            SizingRule::Multiplier(dec("2")),
            SizingRule::FixedUsd(dec("500")),
            SizingRule::BalancePercent(dec("100")),
        ] {
            let mut r = rel(rule);
            r.max_position_usd = Some(dec("40"));
            let sized = size_order(&r, &fill, dec("0.0001"), Some(dec("10000"))).unwrap();
            assert!(sized.adjusted <= dec("0.0008"), "{rule}: {}", sized.adjusted);
            assert!(sized.amount * fill.price <= dec("40"));
        }
    }

    #[test]
    fn test_cap_below_one_lot_quantizes_to_zero() {
        let mut r = rel(SizingRule::Multiplier(dec("1")));
        r.max_position_usd = Some(dec("40"));
        let sized = size_order(&r, &btc_fill("0.002", "50000"), dec("0.001"), None).unwrap();
        assert_eq!(sized.adjusted, dec("0.0008"));
        assert_eq!(sized.amount, Decimal::ZERO);
    }

    #[test]
    fn test_symbol_multiplier_scales_before_cap() {
        let mut r = rel(SizingRule::Multiplier(dec("1")));
        r.symbol_multipliers.insert("BTC".into(), dec("1.5"));
        let sized = size_order(&r, &btc_fill("0.002", "50000"), dec("0.001"), None).unwrap();
        assert_eq!(sized.adjusted, dec("0.003"));

        r.max_position_usd = Some(dec("100"));
        let sized = size_order(&r, &btc_fill("0.002", "50000"), dec("0.001"), None).unwrap();
        assert_eq!(sized.amount, dec("0.002"));
    }

    #[test]
    fn test_zero_price_is_rejected() {
        assert!(matches!(
            base_amount(&SizingRule::FixedUsd(dec("10")), dec("1"), Decimal::ZERO, None),
            Err(SizingError::NonPositivePrice(_))
        ));
    }
}
