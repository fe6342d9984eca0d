use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

use super::ScanError;
use crate::api::{BrokerError, MarketDataSource};
use crate::config::ScanSettings;
use crate::indicators::calculate_rsi;
use crate::models::Resolution;

/// Result of one pass over the universe
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SlowScanReport {
    pub watchlist: Vec<String>,
    pub scanned: usize,
    pub not_ready: usize,
    pub failed: usize,
}

/// 3m RSI for one symbol, None when history is too short
async fn scan_symbol(
    market: Arc<dyn MarketDataSource>,
    symbol: String,
    limit: usize,
    rsi_period: usize,
) -> (String, Result<Option<f64>, BrokerError>) {
    let result = market
        .fetch_candles(&symbol, Resolution::M3, limit)
        .await
        .map(|candles| {
            let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
            calculate_rsi(&closes, rsi_period)
        });
    (symbol, result)
}

/// Triage every symbol by 3m RSI
///
/// Symbols are fetched in concurrent batches of `slow_batch_size` with a
/// pause between batches. A symbol whose RSI sits at or beyond either
/// threshold joins the watchlist. Per-symbol failures skip that symbol;
/// the scan only fails as a whole when nothing could be fetched.
pub async fn slow_scan(
    market: Arc<dyn MarketDataSource>,
    symbols: &[String],
    settings: &ScanSettings,
    rsi_period: usize,
) -> Result<SlowScanReport, ScanError> {
    if symbols.is_empty() {
        return Err(ScanError::EmptyUniverse);
    }

    let mut report = SlowScanReport::default();
    let batches: Vec<&[String]> = symbols.chunks(settings.slow_batch_size.max(1)).collect();
    let pause = Duration::from_millis(settings.slow_batch_pause_ms);

    for (i, batch) in batches.iter().enumerate() {
        let mut tasks = JoinSet::new();
        for symbol in batch.iter() {
            tasks.spawn(scan_symbol(
                market.clone(),
                symbol.clone(),
                settings.slow_candle_limit,
                rsi_period,
            ));
        }

        while let Some(joined) = tasks.join_next().await {
            let (symbol, result) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::error!("Slow scan task panicked: {}", e);
                    report.failed += 1;
                    continue;
                }
            };

            match result {
                Ok(Some(rsi)) => {
                    report.scanned += 1;
                    if rsi <= settings.rsi_low || rsi >= settings.rsi_high {
                        tracing::debug!(symbol = %symbol, rsi, "Added to watchlist");
                        report.watchlist.push(symbol);
                    }
                }
                Ok(None) => report.not_ready += 1,
                Err(e) => {
                    tracing::warn!(symbol = %symbol, "Slow scan fetch failed: {}", e);
                    report.failed += 1;
                }
            }
        }

        if i + 1 < batches.len() && !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
    }

    if report.failed == symbols.len() {
        return Err(ScanError::Unreachable(report.failed));
    }

    report.watchlist.sort();
    Ok(report)
}
