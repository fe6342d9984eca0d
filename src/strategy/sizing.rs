use crate::models::SymbolInfo;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SizingError {
    #[error("no available equity")]
    NoEquity,
    #[error("invalid price {0}")]
    InvalidPrice(f64),
    #[error("quantity {qty} below minimum {min_qty}")]
    BelowMinQty { qty: f64, min_qty: f64 },
}

/// Calculate the quantity for a fresh entry
///
/// notional = available equity * entry percent, bumped to 110% of the
/// exchange minimum notional when it falls short, then converted to a
/// quantity and floored to the symbol's quantity step.
///
/// # Arguments
/// * `available_equity` - Free margin reported by the account
/// * `entry_percent` - Share of equity committed per entry (e.g. 0.05)
/// * `min_notional` - Smallest order value the exchange accepts
pub fn entry_quantity(
    available_equity: f64,
    entry_percent: f64,
    min_notional: f64,
    price: f64,
    info: &SymbolInfo,
) -> Result<f64, SizingError> {
    if available_equity <= 0.0 {
        return Err(SizingError::NoEquity);
    }
    if !price.is_finite() || price <= 0.0 {
        return Err(SizingError::InvalidPrice(price));
    }

    let mut notional = available_equity * entry_percent;
    if notional < min_notional {
        notional = min_notional * 1.1;
    }

    let qty = info.floor_qty(notional / price);
    if qty < info.min_qty || qty <= 0.0 {
        return Err(SizingError::BelowMinQty {
            qty,
            min_qty: info.min_qty,
        });
    }

    Ok(qty)
}

/// Quantity for the next DCA leg (geometric growth on the held quantity)
pub fn scale_in_quantity(held_qty: f64, multiplier: f64, info: &SymbolInfo) -> f64 {
    info.floor_qty(held_qty * multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(qty_precision: u32, min_qty: f64) -> SymbolInfo {
        SymbolInfo {
            symbol: "SOL_USDT".to_string(),
            qty_precision,
            price_precision: 2,
            min_qty,
        }
    }

    #[test]
    fn test_entry_quantity_example() {
        // equity 1000 * 5% = 50 notional; 50 / 50.0 = 1.000
        let qty = entry_quantity(1000.0, 0.05, 6.0, 50.0, &info(3, 0.001)).unwrap();
        assert_eq!(qty, 1.0);
    }

    #[test]
    fn test_entry_quantity_bumps_small_notional() {
        // 100 * 5% = 5.0 < 6.0 -> 6.6 notional; 6.6 / 2.0 = 3.3
        let qty = entry_quantity(100.0, 0.05, 6.0, 2.0, &info(3, 0.001)).unwrap();
        assert_eq!(qty, 3.3);
    }

    #[test]
    fn test_entry_quantity_floors_to_step() {
        // 50 / 30 = 1.6666.. -> 1.66 at two decimals
        let qty = entry_quantity(1000.0, 0.05, 6.0, 30.0, &info(2, 0.01)).unwrap();
        assert_eq!(qty, 1.66);
    }

    #[test]
    fn test_entry_quantity_below_min_qty() {
        // 50 / 30000 = 0.00166 -> 0.001 < min 0.01
        let result = entry_quantity(1000.0, 0.05, 6.0, 30000.0, &info(3, 0.01));
        assert!(matches!(result, Err(SizingError::BelowMinQty { .. })));
    }

    #[test]
    fn test_entry_quantity_no_equity() {
        let result = entry_quantity(0.0, 0.05, 6.0, 50.0, &info(3, 0.001));
        assert_eq!(result, Err(SizingError::NoEquity));
    }

    #[test]
    fn test_scale_in_quantity() {
        assert_eq!(scale_in_quantity(2.0, 1.5, &info(3, 0.001)), 3.0);
        assert_eq!(scale_in_quantity(1.111, 1.5, &info(3, 0.001)), 1.666);
    }
}
