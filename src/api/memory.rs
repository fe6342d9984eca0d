use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

use super::{BrokerError, CandleStream, MarketDataSource};
use crate::market::resample_candles;
use crate::models::{Candle, Resolution, SymbolInfo};

#[derive(Default)]
struct MemoryState {
    universe: Vec<SymbolInfo>,
    candles: HashMap<String, Vec<Candle>>, // 1m, time ordered
    failing: HashSet<String>,
    offline: bool,
}

/// Scripted market data held in memory
///
/// Candles are stored at 1m and resampled on request, so one script serves
/// every resolution. Used for dry runs and tests.
#[derive(Default)]
pub struct MemoryMarket {
    state: Mutex<MemoryState>,
    candle_requests: AtomicUsize,
}

impl MemoryMarket {
    pub fn new(universe: Vec<SymbolInfo>) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                universe,
                ..Default::default()
            }),
            candle_requests: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Replace the 1m history for `symbol`
    pub fn set_candles(&self, symbol: &str, mut candles: Vec<Candle>) {
        candles.sort_by_key(|c| c.open_time);
        self.lock().candles.insert(symbol.to_string(), candles);
    }

    /// Append or overwrite the latest 1m candle for `symbol`
    pub fn push_candle(&self, symbol: &str, candle: Candle) {
        let mut state = self.lock();
        let series = state.candles.entry(symbol.to_string()).or_default();
        match series.last_mut() {
            Some(last) if last.open_time == candle.open_time => *last = candle,
            _ => series.push(candle),
        }
    }

    pub fn set_universe(&self, universe: Vec<SymbolInfo>) {
        self.lock().universe = universe;
    }

    /// Make candle requests for `symbol` fail
    pub fn fail_symbol(&self, symbol: &str, failing: bool) {
        let mut state = self.lock();
        if failing {
            state.failing.insert(symbol.to_string());
        } else {
            state.failing.remove(symbol);
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    pub fn candle_requests(&self) -> usize {
        self.candle_requests.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MarketDataSource for MemoryMarket {
    async fn fetch_candles(
        &self,
        symbol: &str,
        resolution: Resolution,
        limit: usize,
    ) -> Result<Vec<Candle>, BrokerError> {
        self.candle_requests.fetch_add(1, Ordering::Relaxed);
        let state = self.lock();

        if state.offline {
            return Err(BrokerError::Transport("market data offline".into()));
        }
        if state.failing.contains(symbol) {
            return Err(BrokerError::Transport(format!("timeout fetching {}", symbol)));
        }

        let Some(series) = state.candles.get(symbol) else {
            return Ok(Vec::new());
        };

        let bars = if resolution == Resolution::M1 {
            series.clone()
        } else {
            resample_candles(series.iter(), resolution)
        };

        let skip = bars.len().saturating_sub(limit);
        Ok(bars.into_iter().skip(skip).collect())
    }

    async fn fetch_universe(&self) -> Result<Vec<SymbolInfo>, BrokerError> {
        let state = self.lock();
        if state.offline {
            return Err(BrokerError::Transport("market data offline".into()));
        }
        Ok(state.universe.clone())
    }

    /// Send the latest 1m candle of each symbol once, then stay open
    async fn stream_candles(&self, symbols: Vec<String>) -> Result<CandleStream, BrokerError> {
        let latest: Vec<(String, Candle)> = {
            let state = self.lock();
            symbols
                .iter()
                .filter_map(|s| {
                    state
                        .candles
                        .get(s)
                        .and_then(|series| series.last())
                        .map(|c| (s.clone(), c.clone()))
                })
                .collect()
        };

        let (tx, rx) = mpsc::channel(latest.len().max(1));
        tokio::spawn(async move {
            for item in latest {
                if tx.send(item).await.is_err() {
                    return;
                }
            }
            tx.closed().await;
        });

        Ok(rx)
    }
}
