// Technical indicators module
// RSI, ATR and Bollinger Bands over candle series, plus the per-symbol metrics engine

pub mod atr;
pub mod bollinger;
pub mod metrics;
pub mod moving_average;
pub mod rsi;

pub use atr::{calculate_atr, true_ranges};
pub use bollinger::{calculate_bollinger, BollingerBands};
pub use metrics::MetricsEngine;
pub use moving_average::{calculate_sma, calculate_std_dev};
pub use rsi::calculate_rsi;
