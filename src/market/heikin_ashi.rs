use crate::models::{Candle, HaFlip};

/// Smoothed Heikin-Ashi bar
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HaCandle {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl HaCandle {
    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }
}

/// Convert regular candles to Heikin-Ashi
///
/// The first bar seeds its open from the midpoint of the raw open/close.
pub fn heikin_ashi(candles: &[Candle]) -> Vec<HaCandle> {
    let mut out: Vec<HaCandle> = Vec::with_capacity(candles.len());

    for c in candles {
        let close = (c.open + c.high + c.low + c.close) / 4.0;
        let open = match out.last() {
            Some(prev) => (prev.open + prev.close) / 2.0,
            None => (c.open + c.close) / 2.0,
        };

        out.push(HaCandle {
            open,
            high: c.high.max(open).max(close),
            low: c.low.min(open).min(close),
            close,
        });
    }

    out
}

/// Detect a colour flip on the most recent Heikin-Ashi bar
///
/// Fires when the last `run_length` bars before the current one all share a
/// colour and the current bar has the opposite colour. Doji bars break a run.
pub fn detect_flip(candles: &[Candle], run_length: usize) -> Option<HaFlip> {
    if run_length == 0 || candles.len() < run_length + 1 {
        return None;
    }

    let ha = heikin_ashi(candles);
    let (current, history) = ha.split_last()?;
    let run = &history[history.len() - run_length..];

    if current.is_bearish() && run.iter().all(HaCandle::is_bullish) {
        return Some(HaFlip::TurnedBearish);
    }
    if current.is_bullish() && run.iter().all(HaCandle::is_bearish) {
        return Some(HaFlip::TurnedBullish);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn candle(i: i64, open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            open_time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(i),
            open,
            high,
            low,
            close,
            volume: 1.0,
        }
    }

    /// Seed bar, five rising bars, then a sharp red bar
    fn rally_then_dump() -> Vec<Candle> {
        let mut candles: Vec<Candle> = (0..6)
            .map(|i| {
                let p = 100.0 + i as f64;
                candle(i, p, p + 1.0, p, p + 1.0)
            })
            .collect();
        candles.push(candle(6, 105.0, 105.0, 99.0, 100.0));
        candles
    }

    #[test]
    fn test_heikin_ashi_values() {
        let ha = heikin_ashi(&rally_then_dump());

        assert_eq!(ha.len(), 7);
        // Seed bar: open = (100 + 101) / 2, close = (100 + 101 + 100 + 101) / 4
        assert_eq!(ha[0].open, 100.5);
        assert_eq!(ha[0].close, 100.5);
        // Next open is the midpoint of the previous HA body
        assert_eq!(ha[1].open, 100.5);
        assert_eq!(ha[1].close, 101.5);
        assert_eq!(ha[2].open, 101.0);
        assert!(ha[1..6].iter().all(HaCandle::is_bullish));
        assert!(ha[6].is_bearish());
    }

    #[test]
    fn test_detect_bearish_flip() {
        assert_eq!(detect_flip(&rally_then_dump(), 5), Some(HaFlip::TurnedBearish));
    }

    #[test]
    fn test_flip_requires_full_run() {
        // Seed bar is a doji, so a run of six is broken
        assert_eq!(detect_flip(&rally_then_dump(), 6), None);
    }

    #[test]
    fn test_no_flip_while_trend_continues() {
        let candles = &rally_then_dump()[..6];
        assert_eq!(detect_flip(candles, 4), None);
    }

    #[test]
    fn test_insufficient_candles() {
        assert_eq!(detect_flip(&rally_then_dump()[..3], 5), None);
        assert_eq!(detect_flip(&[], 5), None);
    }
}
