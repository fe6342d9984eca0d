use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use super::{calculate_atr, calculate_bollinger, calculate_rsi};
use crate::market::{detect_flip, SeriesCache};
use crate::models::{MetricsSnapshot, Resolution};
use crate::strategy::StrategyParams;

/// Enough 1m history to let the Heikin-Ashi smoothing settle
const HA_LOOKBACK: usize = 60;

/// Slow-moving indicators reused until they expire
#[derive(Debug, Clone, Copy)]
struct SlowMetrics {
    rsi_3m: f64,
    atr_15m: f64,
    computed_at: DateTime<Utc>,
}

/// Builds per-symbol `MetricsSnapshot`s from the series cache
///
/// 1m indicators are recomputed on every call. The 3m RSI and 15m ATR are
/// derived by resampling the 1m series and cached per symbol for `ttl`.
pub struct MetricsEngine {
    ttl: Duration,
    slow: Mutex<HashMap<String, SlowMetrics>>,
}

impl MetricsEngine {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slow: Mutex::new(HashMap::new()),
        }
    }

    /// Compute a snapshot for `symbol`
    ///
    /// Returns None while the cache does not hold enough candles for every
    /// indicator; that is a normal warm-up state, not an error.
    pub fn compute(
        &self,
        symbol: &str,
        cache: &SeriesCache,
        params: &StrategyParams,
        now: DateTime<Utc>,
    ) -> Option<MetricsSnapshot> {
        let needed = (params.rsi_period + 1)
            .max(params.atr_period + 1)
            .max(params.bb_period)
            .max(HA_LOOKBACK);

        let m1 = cache.window(symbol, Resolution::M1, needed).ok()?;
        let closes: Vec<f64> = m1.iter().map(|c| c.close).collect();

        let (Some(rsi_1m), Some(atr_1m), Some(bands), Some(last)) = (
            calculate_rsi(&closes, params.rsi_period),
            calculate_atr(&m1, params.atr_period),
            calculate_bollinger(&closes, params.bb_period, params.bb_std_mult),
            m1.last(),
        ) else {
            tracing::debug!(symbol, candles = m1.len(), "Not enough 1m data yet");
            return None;
        };

        let slow = self.slow_metrics(symbol, cache, params, now)?;

        Some(MetricsSnapshot {
            symbol: symbol.to_string(),
            timestamp: now,
            rsi_1m,
            rsi_3m: slow.rsi_3m,
            atr_1m,
            atr_15m: slow.atr_15m,
            bb_lower: bands.lower,
            bb_upper: bands.upper,
            price: last.close,
            bar_move: last.body(),
            ha_flip: detect_flip(&m1, params.ha_run_length),
        })
    }

    fn slow_metrics(
        &self,
        symbol: &str,
        cache: &SeriesCache,
        params: &StrategyParams,
        now: DateTime<Utc>,
    ) -> Option<SlowMetrics> {
        let mut slow = self.slow.lock().unwrap_or_else(|p| p.into_inner());

        if let Some(cached) = slow.get(symbol) {
            if now - cached.computed_at < self.ttl {
                return Some(*cached);
            }
        }

        let m3 = cache.resample(symbol, Resolution::M1, Resolution::M3).ok()?;
        let m15 = cache.resample(symbol, Resolution::M1, Resolution::M15).ok()?;
        let closes_3m: Vec<f64> = m3.iter().map(|c| c.close).collect();

        let (Some(rsi_3m), Some(atr_15m)) = (
            calculate_rsi(&closes_3m, params.rsi_period),
            calculate_atr(&m15, params.atr_period),
        ) else {
            tracing::debug!(
                symbol,
                bars_3m = m3.len(),
                bars_15m = m15.len(),
                "Not enough history for 3m RSI / 15m ATR yet"
            );
            return None;
        };

        let fresh = SlowMetrics {
            rsi_3m,
            atr_15m,
            computed_at: now,
        };
        slow.insert(symbol.to_string(), fresh);
        Some(fresh)
    }

    /// When the cached slow indicators for `symbol` were computed
    pub fn slow_computed_at(&self, symbol: &str) -> Option<DateTime<Utc>> {
        let slow = self.slow.lock().unwrap_or_else(|p| p.into_inner());
        slow.get(symbol).map(|m| m.computed_at)
    }

    pub fn evict(&self, symbol: &str) {
        let mut slow = self.slow.lock().unwrap_or_else(|p| p.into_inner());
        slow.remove(symbol);
    }

    /// Drop cached entries for symbols outside `keep`
    pub fn retain(&self, keep: &HashSet<String>) {
        let mut slow = self.slow.lock().unwrap_or_else(|p| p.into_inner());
        slow.retain(|symbol, _| keep.contains(symbol));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Candle;
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn fill(cache: &SeriesCache, symbol: &str, count: usize) {
        let mut prev = 100.0;
        for i in 0..count {
            let close = 100.0 + 5.0 * (i as f64 / 7.0).sin();
            cache
                .upsert(
                    symbol,
                    Resolution::M1,
                    Candle {
                        open_time: start() + Duration::minutes(i as i64),
                        open: prev,
                        high: prev.max(close) + 0.2,
                        low: prev.min(close) - 0.2,
                        close,
                        volume: 10.0,
                    },
                )
                .unwrap();
            prev = close;
        }
    }

    #[test]
    fn test_compute_full_snapshot() {
        let cache = SeriesCache::new(1500);
        fill(&cache, "SOL_USDT", 300);
        let engine = MetricsEngine::new(Duration::seconds(60));

        let m = engine
            .compute("SOL_USDT", &cache, &StrategyParams::default(), start())
            .unwrap();

        assert!((0.0..=100.0).contains(&m.rsi_1m));
        assert!((0.0..=100.0).contains(&m.rsi_3m));
        assert!(m.atr_1m > 0.0);
        assert!(m.atr_15m > m.atr_1m);
        assert!(m.bb_lower < m.bb_upper);

        let last = cache.window("SOL_USDT", Resolution::M1, 1).unwrap();
        assert_eq!(m.price, last[0].close);
        assert_eq!(m.bar_move, last[0].close - last[0].open);
    }

    #[test]
    fn test_insufficient_data_is_none() {
        let cache = SeriesCache::new(1500);
        fill(&cache, "SOL_USDT", 30);
        let engine = MetricsEngine::new(Duration::seconds(60));

        assert!(engine
            .compute("SOL_USDT", &cache, &StrategyParams::default(), start())
            .is_none());
        assert!(engine
            .compute("MISSING", &cache, &StrategyParams::default(), start())
            .is_none());
    }

    #[test]
    fn test_enough_1m_but_not_15m_history() {
        // 100 minutes -> 7 buckets of 15m, ATR(14) needs 15
        let cache = SeriesCache::new(1500);
        fill(&cache, "SOL_USDT", 100);
        let engine = MetricsEngine::new(Duration::seconds(60));

        assert!(engine
            .compute("SOL_USDT", &cache, &StrategyParams::default(), start())
            .is_none());
    }

    #[test]
    fn test_slow_metrics_reused_within_ttl() {
        let cache = SeriesCache::new(1500);
        fill(&cache, "SOL_USDT", 300);
        let engine = MetricsEngine::new(Duration::seconds(60));
        let params = StrategyParams::default();
        let t0 = start();

        engine.compute("SOL_USDT", &cache, &params, t0).unwrap();
        assert_eq!(engine.slow_computed_at("SOL_USDT"), Some(t0));

        engine
            .compute("SOL_USDT", &cache, &params, t0 + Duration::seconds(30))
            .unwrap();
        assert_eq!(engine.slow_computed_at("SOL_USDT"), Some(t0));

        let t1 = t0 + Duration::seconds(60);
        engine.compute("SOL_USDT", &cache, &params, t1).unwrap();
        assert_eq!(engine.slow_computed_at("SOL_USDT"), Some(t1));
    }

    #[test]
    fn test_retain_drops_other_symbols() {
        let cache = SeriesCache::new(1500);
        fill(&cache, "SOL_USDT", 300);
        fill(&cache, "BTC_USDT", 300);
        let engine = MetricsEngine::new(Duration::seconds(60));
        let params = StrategyParams::default();

        engine.compute("SOL_USDT", &cache, &params, start()).unwrap();
        engine.compute("BTC_USDT", &cache, &params, start()).unwrap();

        engine.retain(&HashSet::from(["SOL_USDT".to_string()]));
        assert!(engine.slow_computed_at("SOL_USDT").is_some());
        assert!(engine.slow_computed_at("BTC_USDT").is_none());
    }
}
