use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;

use super::ScanError;
use crate::api::{BrokerError, MarketDataSource};
use crate::config::SeriesSettings;
use crate::execution::{ExecutionCoordinator, PositionLedger};
use crate::indicators::MetricsEngine;
use crate::market::SeriesCache;
use crate::models::{Action, PositionState, Resolution};
use crate::strategy::{evaluate, StrategyParams};

/// Per-symbol result of a fast scan
#[derive(Debug, Clone, PartialEq)]
enum SymbolOutcome {
    NotReady,
    Idle,
    Executed(Action),
    Rejected(Action),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FastScanReport {
    pub evaluated: usize,
    pub not_ready: usize,
    pub failed: usize,
    pub actions: Vec<(String, Action)>,  // Executed actions, sorted by symbol
    pub rejected: Vec<(String, Action)>, // Decided but not carried out
}

/// Everything a fast scan needs, shared across per-symbol tasks
pub struct FastScanner {
    pub market: Arc<dyn MarketDataSource>,
    pub cache: SeriesCache,
    pub metrics: Arc<MetricsEngine>,
    pub coordinator: Arc<ExecutionCoordinator>,
    pub ledger: Arc<Mutex<PositionLedger>>,
    pub params: StrategyParams,
    pub series: SeriesSettings,
    pub symbol_limit: usize,
}

impl FastScanner {
    /// Pull fresh 1m candles into the cache
    ///
    /// A symbol without enough history gets the full warm-up window, later
    /// scans only fetch the tail.
    async fn refresh_series(&self, symbol: &str) -> Result<(), BrokerError> {
        let cached = self.cache.len(symbol, Resolution::M1).unwrap_or(0);
        let limit = if cached < self.series.warmup_candles {
            self.series.warmup_candles
        } else {
            self.series.refresh_candles
        };

        let candles = self.market.fetch_candles(symbol, Resolution::M1, limit).await?;
        if let Err(e) = self.cache.extend(symbol, Resolution::M1, candles) {
            tracing::error!(symbol, "Series cache update failed: {}", e);
        }
        Ok(())
    }

    async fn process_symbol(
        &self,
        symbol: &str,
        now: DateTime<Utc>,
    ) -> Result<SymbolOutcome, BrokerError> {
        self.refresh_series(symbol).await?;

        let Some(metrics) = self.metrics.compute(symbol, &self.cache, &self.params, now) else {
            return Ok(SymbolOutcome::NotReady);
        };

        let (state, open_count) = {
            let ledger = self.ledger.lock().unwrap_or_else(|p| p.into_inner());
            (ledger.get(symbol).cloned(), ledger.open_count())
        };

        // Position management comes before new-entry scanning
        let action = match &state {
            Some(PositionState::Pending { .. }) => Action::NoOp,
            Some(PositionState::Confirmed(position)) => {
                evaluate(&metrics, Some(position), &self.params, now)
            }
            None => match evaluate(&metrics, None, &self.params, now) {
                Action::Enter(_) if open_count >= self.symbol_limit => {
                    tracing::debug!(symbol, open_count, "Entry signal ignored, symbol limit reached");
                    Action::NoOp
                }
                action => action,
            },
        };

        if action == Action::NoOp {
            return Ok(SymbolOutcome::Idle);
        }

        match self.coordinator.apply(&metrics, &action, now).await {
            Ok(outcome) => {
                tracing::debug!(symbol, ?outcome, "Action executed");
                Ok(SymbolOutcome::Executed(action))
            }
            Err(e) => {
                if e.is_benign() {
                    tracing::debug!(symbol, "Action skipped: {}", e);
                } else {
                    tracing::warn!(symbol, ?action, "Action failed: {}", e);
                }
                Ok(SymbolOutcome::Rejected(action))
            }
        }
    }
}

/// Refresh, evaluate and act on each focus symbol
///
/// Symbols run concurrently; one symbol's failure never stops the others.
/// The cycle fails only when every symbol's candle fetch failed.
pub async fn fast_scan(
    scanner: Arc<FastScanner>,
    focus: Vec<String>,
    now: DateTime<Utc>,
) -> Result<FastScanReport, ScanError> {
    let total = focus.len();
    let mut report = FastScanReport::default();
    let mut tasks = JoinSet::new();

    for symbol in focus {
        let scanner = scanner.clone();
        tasks.spawn(async move {
            let outcome = scanner.process_symbol(&symbol, now).await;
            (symbol, outcome)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((_, Ok(SymbolOutcome::NotReady))) => report.not_ready += 1,
            Ok((_, Ok(SymbolOutcome::Idle))) => report.evaluated += 1,
            Ok((symbol, Ok(SymbolOutcome::Executed(action)))) => {
                report.evaluated += 1;
                report.actions.push((symbol, action));
            }
            Ok((symbol, Ok(SymbolOutcome::Rejected(action)))) => {
                report.evaluated += 1;
                report.rejected.push((symbol, action));
            }
            Ok((symbol, Err(e))) => {
                if e.is_transient() {
                    tracing::warn!(symbol = %symbol, "Fast scan skipped symbol: {}", e);
                } else {
                    tracing::error!(symbol = %symbol, "Fast scan failed for symbol: {}", e);
                }
                report.failed += 1;
            }
            Err(e) => {
                tracing::error!("Fast scan task panicked: {}", e);
                report.failed += 1;
            }
        }
    }

    if total > 0 && report.failed == total {
        return Err(ScanError::Unreachable(total));
    }

    report.actions.sort_by(|a, b| a.0.cmp(&b.0));
    report.rejected.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{MemoryMarket, PaperAccount};
    use crate::config::ExecutionSettings;
    use crate::execution::CooldownMap;
    use crate::market::SymbolCatalog;
    use crate::models::{Candle, Side, SymbolInfo};
    use crate::persistence::MemorySnapshotStore;
    use chrono::{Duration, TimeZone};

    /// Slow grind lower ending in a sharp flush: a textbook long entry
    fn capitulation(bars: i64) -> Vec<Candle> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut price = 100.0;
        (0..bars)
            .map(|i| {
                let drop = if i == bars - 1 { 3.0 } else { 0.1 };
                let open = price;
                price -= drop;
                Candle {
                    open_time: start + Duration::minutes(i),
                    open,
                    high: open + 0.05,
                    low: price - 0.05,
                    close: price,
                    volume: 1.0,
                }
            })
            .collect()
    }

    fn info(symbol: &str) -> SymbolInfo {
        SymbolInfo {
            symbol: symbol.to_string(),
            qty_precision: 3,
            price_precision: 2,
            min_qty: 0.001,
        }
    }

    fn scanner(market: Arc<MemoryMarket>) -> (Arc<FastScanner>, Arc<Mutex<PositionLedger>>) {
        let catalog = SymbolCatalog::new();
        catalog.replace(vec![info("SOL_USDT"), info("BTC_USDT")]);
        let cache = SeriesCache::new(1500);
        let account = Arc::new(PaperAccount::new(1000.0, cache.clone(), catalog.clone()));
        let ledger = Arc::new(Mutex::new(PositionLedger::new(3)));
        let params = StrategyParams::default();

        let coordinator = Arc::new(ExecutionCoordinator::new(
            account,
            market.clone(),
            catalog,
            ledger.clone(),
            Arc::new(Mutex::new(CooldownMap::new())),
            Arc::new(MemorySnapshotStore::new()),
            ExecutionSettings::default(),
            params.clone(),
        ));

        let scanner = Arc::new(FastScanner {
            market,
            cache,
            metrics: Arc::new(MetricsEngine::new(chrono::Duration::seconds(60))),
            coordinator,
            ledger: ledger.clone(),
            params,
            series: SeriesSettings::default(),
            symbol_limit: 5,
        });
        (scanner, ledger)
    }

    #[tokio::test]
    async fn test_entry_signal_opens_position() {
        let market = Arc::new(MemoryMarket::new(Vec::new()));
        market.set_candles("SOL_USDT", capitulation(300));
        let (scanner, ledger) = scanner(market);

        let report = fast_scan(scanner, vec!["SOL_USDT".to_string()], Utc::now())
            .await
            .unwrap();

        assert_eq!(
            report.actions,
            vec![("SOL_USDT".to_string(), Action::Enter(Side::Long))]
        );
        let ledger = ledger.lock().unwrap();
        let position = ledger.position("SOL_USDT").unwrap();
        assert_eq!(position.side, Side::Long);
        assert!(position.quantity > 0.0);
    }

    #[tokio::test]
    async fn test_failed_order_is_not_reported_as_action() {
        let market = Arc::new(MemoryMarket::new(Vec::new()));
        // Signals fire on both, but ETH has no contract constraints
        market.set_candles("SOL_USDT", capitulation(300));
        market.set_candles("ETH_USDT", capitulation(300));
        let (scanner, ledger) = scanner(market);

        let focus = vec!["SOL_USDT".to_string(), "ETH_USDT".to_string()];
        let report = fast_scan(scanner, focus, Utc::now()).await.unwrap();

        assert_eq!(report.evaluated, 2);
        assert_eq!(
            report.actions,
            vec![("SOL_USDT".to_string(), Action::Enter(Side::Long))]
        );
        assert_eq!(
            report.rejected,
            vec![("ETH_USDT".to_string(), Action::Enter(Side::Long))]
        );
        assert!(!ledger.lock().unwrap().contains("ETH_USDT"));
    }

    #[tokio::test]
    async fn test_failures_and_warmup_are_isolated() {
        let market = Arc::new(MemoryMarket::new(Vec::new()));
        market.set_candles("SOL_USDT", capitulation(300));
        market.set_candles("BTC_USDT", capitulation(20));
        market.fail_symbol("ETH_USDT", true);
        let (scanner, _) = scanner(market);

        let focus = vec![
            "SOL_USDT".to_string(),
            "BTC_USDT".to_string(),
            "ETH_USDT".to_string(),
        ];
        let report = fast_scan(scanner, focus, Utc::now()).await.unwrap();

        assert_eq!(report.evaluated, 1);
        assert_eq!(report.not_ready, 1);
        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn test_pending_symbol_is_left_alone() {
        let market = Arc::new(MemoryMarket::new(Vec::new()));
        market.set_candles("SOL_USDT", capitulation(300));
        let (scanner, ledger) = scanner(market);
        ledger
            .lock()
            .unwrap()
            .try_reserve("SOL_USDT", Side::Long, 5, Utc::now())
            .unwrap();

        let report = fast_scan(scanner, vec!["SOL_USDT".to_string()], Utc::now())
            .await
            .unwrap();
        assert_eq!(report.evaluated, 1);
        assert!(report.actions.is_empty());
    }

    #[tokio::test]
    async fn test_symbol_limit_suppresses_entries() {
        let market = Arc::new(MemoryMarket::new(Vec::new()));
        market.set_candles("SOL_USDT", capitulation(300));
        let (scanner, ledger) = scanner(market);
        {
            let mut ledger = ledger.lock().unwrap();
            for symbol in ["A", "B", "C", "D", "E"] {
                ledger.try_reserve(symbol, Side::Short, 5, Utc::now()).unwrap();
            }
        }

        let report = fast_scan(scanner, vec!["SOL_USDT".to_string()], Utc::now())
            .await
            .unwrap();
        assert!(report.actions.is_empty());
        assert!(!ledger.lock().unwrap().contains("SOL_USDT"));
    }

    #[tokio::test]
    async fn test_all_failures_fail_the_cycle() {
        let market = Arc::new(MemoryMarket::new(Vec::new()));
        market.set_offline(true);
        let (scanner, _) = scanner(market);

        let result = fast_scan(scanner, vec!["SOL_USDT".to_string()], Utc::now()).await;
        assert_eq!(result, Err(ScanError::Unreachable(1)));
    }
}
