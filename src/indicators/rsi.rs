/// Calculate Relative Strength Index (RSI)
///
/// RSI measures the magnitude of recent price changes to evaluate
/// overbought or oversold conditions. Gains and losses are averaged with a
/// simple rolling mean over the trailing `period` close-to-close changes.
///
/// Values:
/// - RSI > 70: Overbought
/// - RSI < 30: Oversold
///
/// Returns None when fewer than `period + 1` prices are available.
pub fn calculate_rsi(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period + 1 {
        return None;
    }

    let mut gains = Vec::with_capacity(period);
    let mut losses = Vec::with_capacity(period);

    // Only the trailing window matters
    let window = &prices[prices.len() - period - 1..];
    for pair in window.windows(2) {
        let change = pair[1] - pair[0];
        if change > 0.0 {
            gains.push(change);
            losses.push(0.0);
        } else {
            gains.push(0.0);
            losses.push(change.abs());
        }
    }

    // Calculate average gain and loss
    let avg_gain: f64 = gains.iter().sum::<f64>() / period as f64;
    let avg_loss: f64 = losses.iter().sum::<f64>() / period as f64;

    // A flat window has no momentum either way
    if avg_loss == 0.0 && avg_gain == 0.0 {
        return Some(50.0);
    }
    if avg_loss == 0.0 {
        return Some(100.0);
    }

    let rs = avg_gain / avg_loss;
    let rsi = 100.0 - (100.0 / (1.0 + rs));

    Some(rsi.clamp(0.0, 100.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rsi_calculation() {
        // Test with known values
        let prices = vec![
            44.0, 44.25, 44.5, 43.75, 44.0, 44.5, 45.0, 45.5, 45.25, 45.5, 46.0, 46.5, 46.25,
            46.0, 46.5,
        ];

        let rsi = calculate_rsi(&prices, 14);
        assert!(rsi.is_some());

        let rsi_value = rsi.unwrap();
        assert!(rsi_value > 0.0 && rsi_value < 100.0);
    }

    #[test]
    fn test_rsi_insufficient_data() {
        let prices = vec![100.0, 102.0, 101.0];
        let rsi = calculate_rsi(&prices, 14);
        assert!(rsi.is_none());
    }

    #[test]
    fn test_rsi_all_gains() {
        let prices = vec![100.0, 101.0, 102.0, 103.0, 104.0, 105.0];
        let rsi = calculate_rsi(&prices, 5);
        assert!(rsi.is_some());
        assert_eq!(rsi.unwrap(), 100.0); // All gains = RSI 100
    }

    #[test]
    fn test_rsi_all_losses() {
        let prices = vec![105.0, 104.0, 103.0, 102.0, 101.0, 100.0];
        assert_eq!(calculate_rsi(&prices, 5), Some(0.0));
    }

    #[test]
    fn test_rsi_flat_window_is_neutral() {
        let prices = vec![100.0; 6];
        assert_eq!(calculate_rsi(&prices, 5), Some(50.0));

        // Movement before the window does not count
        let prices = vec![90.0, 100.0, 100.0, 100.0, 100.0];
        assert_eq!(calculate_rsi(&prices, 3), Some(50.0));
    }

    #[test]
    fn test_rsi_uses_trailing_window_only() {
        // Early crash is outside the 3-change window
        let prices = vec![200.0, 100.0, 101.0, 100.0, 101.0];
        let rsi = calculate_rsi(&prices, 3).unwrap();
        // gains: 1, 1 ; losses: 1 -> RS = 2 -> 66.67
        assert!((rsi - 66.666_666).abs() < 1e-3);
    }

    #[test]
    fn test_rsi_bounded() {
        let mut prices = Vec::new();
        let mut p = 100.0;
        for i in 0..200 {
            p += if i % 7 < 3 { 1.3 } else { -0.9 };
            prices.push(p);
            if let Some(rsi) = calculate_rsi(&prices, 14) {
                assert!((0.0..=100.0).contains(&rsi));
            }
        }
    }
}
