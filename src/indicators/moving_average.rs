/// Calculate Simple Moving Average (SMA) of the trailing `period` values
pub fn calculate_sma(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }

    let sum: f64 = prices.iter().rev().take(period).sum();
    Some(sum / period as f64)
}

/// Population standard deviation of the trailing `period` values
pub fn calculate_std_dev(prices: &[f64], period: usize) -> Option<f64> {
    let mean = calculate_sma(prices, period)?;

    let variance = prices
        .iter()
        .rev()
        .take(period)
        .map(|p| (p - mean).powi(2))
        .sum::<f64>()
        / period as f64;

    Some(variance.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sma() {
        let prices = vec![100.0, 102.0, 104.0, 106.0, 108.0];
        let sma = calculate_sma(&prices, 5);
        assert_eq!(sma, Some(104.0));
    }

    #[test]
    fn test_sma_insufficient_data() {
        let prices = vec![100.0, 102.0];
        let sma = calculate_sma(&prices, 5);
        assert!(sma.is_none());
    }

    #[test]
    fn test_std_dev() {
        let prices = vec![2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert_eq!(calculate_std_dev(&prices, 8), Some(2.0));
    }

    #[test]
    fn test_std_dev_flat() {
        let prices = vec![10.0; 20];
        assert_eq!(calculate_std_dev(&prices, 20), Some(0.0));
    }
}
