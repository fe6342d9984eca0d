use super::moving_average::{calculate_sma, calculate_std_dev};

/// Bollinger Bands around a rolling mean of closes
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BollingerBands {
    pub lower: f64,
    pub middle: f64,
    pub upper: f64,
}

/// Calculate Bollinger Bands over the trailing `period` closes
///
/// middle = SMA(period), bands = middle -/+ std_mult * population std dev.
/// Returns None with fewer than `period` closes.
pub fn calculate_bollinger(closes: &[f64], period: usize, std_mult: f64) -> Option<BollingerBands> {
    let middle = calculate_sma(closes, period)?;
    let std_dev = calculate_std_dev(closes, period)?;

    Some(BollingerBands {
        lower: middle - std_mult * std_dev,
        middle,
        upper: middle + std_mult * std_dev,
    })
}
