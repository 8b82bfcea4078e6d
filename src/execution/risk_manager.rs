use rust_decimal::Decimal;
use thiserror::Error;

use crate::exchange::ApiPosition;
use crate::models::quantize;

/// Reasons a sized order is dropped before it reaches the exchange.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RiskViolation {
    #[error("order amount rounds to zero")]
    ZeroAmount,

    #[error("notional {notional} exceeds available balance {available}")]
    InsufficientBalance { notional: Decimal, available: Decimal },

    #[error("leverage cap {leverage}x leaves no tradable amount at price {price}")]
    LeverageExhausted { leverage: u32, price: Decimal },

    #[error("exposure {current} + {additional} would exceed limit {limit}")]
    ExposureExceeded {
        current: Decimal,
        additional: Decimal,
        limit: Decimal,
    },
}

/// An order may only spend what the copier has available.
pub fn check_balance(notional: Decimal, available: Decimal) -> Result<(), RiskViolation> {
    if notional > available {
        return Err(RiskViolation::InsufficientBalance { notional, available });
    }
    Ok(())
}

/// Clamp `amount` to what `available × leverage` can carry at `price`,
/// rounded back down to the lot grid.
pub fn clamp_to_leverage(
    amount: Decimal,
    price: Decimal,
    available: Decimal,
    leverage: u32,
    lot_size: Decimal,
) -> Result<Decimal, RiskViolation> {
    if price <= Decimal::ZERO {
        return Err(RiskViolation::LeverageExhausted { leverage, price });
    }
    let max_amount = available * Decimal::from(leverage) / price;
    let clamped = quantize(amount.min(max_amount), lot_size);
    if clamped <= Decimal::ZERO {
        return Err(RiskViolation::LeverageExhausted { leverage, price });
    }
    Ok(clamped)
}

/// Sum of |amount| × entry price across open positions.
pub fn current_exposure(positions: &[ApiPosition]) -> Decimal {
    positions.iter().map(ApiPosition::notional).sum()
}

/// Returns the exposure the account would carry after the order.
pub fn check_exposure(
    positions: &[ApiPosition],
    additional: Decimal,
    limit: Decimal,
) -> Result<Decimal, RiskViolation> {
    let current = current_exposure(positions);
    let total = current + additional;
    if total > limit {
        return Err(RiskViolation::ExposureExceeded {
            current,
            additional,
            limit,
        });
    }
    Ok(total)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Side;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn position(symbol: &str, amount: &str, entry: &str) -> ApiPosition {
        ApiPosition {
            symbol: symbol.into(),
            side: Some(Side::Bid),
            amount: dec(amount),
            entry_price: dec(entry),
            margin: None,
            isolated: None,
        }
    }

    #[test]
    fn test_balance_too_small_is_a_violation() {
        assert_eq!(
            check_balance(dec("62"), dec("10")),
            Err(RiskViolation::InsufficientBalance {
                notional: dec("62"),
                available: dec("10"),
            })
        );
        assert!(check_balance(dec("10"), dec("10")).is_ok());
    }

    #[test]
    fn test_leverage_clamp_requantizes() {
        // 100 × 2 / 50000 = 0.004 max
        let clamped = clamp_to_leverage(dec("0.0075"), dec("50000"), dec("100"), 2, dec("0.001")).unwrap();
        assert_eq!(clamped, dec("0.004"));

        // Under the cap the amount is untouched.
        let clamped = clamp_to_leverage(dec("0.002"), dec("50000"), dec("100"), 2, dec("0.001")).unwrap();
        assert_eq!(clamped, dec("0.002"));
    }

    #[test]
    fn test_leverage_clamp_to_zero_is_a_violation() {
        assert!(matches!(
            clamp_to_leverage(dec("0.01"), dec("50000"), dec("20"), 1, dec("0.001")),
            Err(RiskViolation::LeverageExhausted { leverage: 1, .. })
        ));
    }

    #[test]
    fn test_exposure_counts_shorts_by_magnitude() {
        let positions = vec![position("BTC", "0.01", "50000"), position("ETH", "-1", "3000")];
        assert_eq!(current_exposure(&positions), dec("3500"));

        assert_eq!(check_exposure(&positions, dec("500"), dec("4000")).unwrap(), dec("4000"));
        assert!(matches!(
            check_exposure(&positions, dec("501"), dec("4000")),
            Err(RiskViolation::ExposureExceeded { .. })
        ));
    }

    #[test]
    fn test_no_positions_means_zero_exposure() {
        assert_eq!(current_exposure(&[]), Decimal::ZERO);
        assert!(check_exposure(&[], dec("100"), dec("100")).is_ok());
    }
}
