use crate::models::Side;

/// Distance from the average entry to the take-profit target
///
/// The larger of a volatility target (ATR_15m * multiplier) and a floor
/// expressed as a fraction of the entry price.
pub fn take_profit_distance(avg_entry: f64, atr_15m: f64, tp_atr_mult: f64, min_tp_pct: f64) -> f64 {
    (atr_15m * tp_atr_mult).max(avg_entry * min_tp_pct)
}

/// Take-profit limit price for a position
pub fn take_profit_price(
    side: Side,
    avg_entry: f64,
    atr_15m: f64,
    tp_atr_mult: f64,
    min_tp_pct: f64,
) -> f64 {
    let distance = take_profit_distance(avg_entry, atr_15m, tp_atr_mult, min_tp_pct);
    avg_entry + side.sign() * distance
}
