/// Average True Range (ATR) indicator
///
/// Measures market volatility by averaging true ranges over a period.
/// True Range is the greatest of:
/// - Current High - Current Low
/// - Abs(Current High - Previous Close)
/// - Abs(Current Low - Previous Close)
///
/// The average is a simple rolling mean over the trailing `period` bars.
use crate::models::Candle;

/// True range of every candle that has a predecessor
pub fn true_ranges(candles: &[Candle]) -> Vec<f64> {
    candles
        .windows(2)
        .map(|pair| {
            let high = pair[1].high;
            let low = pair[1].low;
            let prev_close = pair[0].close;

            (high - low)
                .max((high - prev_close).abs())
                .max((low - prev_close).abs())
        })
        .collect()
}

/// Calculate ATR for the given candles
///
/// Returns the current ATR value, or None if fewer than `period + 1` candles
pub fn calculate_atr(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }

    let window = &candles[candles.len() - period - 1..];
    let ranges = true_ranges(window);

    Some(ranges.iter().sum::<f64>() / period as f64)
}
