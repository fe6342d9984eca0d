// Trading strategy module
pub mod evaluator;
pub mod sizing;
pub mod take_profit;

use serde::{Deserialize, Serialize};

pub use evaluator::{evaluate, is_heavy_entry};
pub use sizing::{entry_quantity, scale_in_quantity, SizingError};
pub use take_profit::{take_profit_distance, take_profit_price};

/// Thresholds and multipliers for the mean-reversion DCA strategy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyParams {
    pub rsi_period: usize,
    pub atr_period: usize,
    pub bb_period: usize,
    pub bb_std_mult: f64,
    // Entry
    pub long_rsi_3m: f64,
    pub short_rsi_3m: f64,
    pub strong_long_rsi_1m: f64,
    pub strong_short_rsi_1m: f64,
    pub heavy_long_rsi_1m: f64,  // 1m RSI past these sizes the entry up
    pub heavy_short_rsi_1m: f64,
    pub impulse_atr_mult: f64,
    // Scale-in
    pub max_dca: u32,
    pub dca_gaps: Vec<f64>, // ATR_15m multiples, indexed by current DCA count
    pub dca_multiplier: f64,
    pub dca_long_rsi_1m: f64,
    pub dca_short_rsi_1m: f64,
    // Take profit
    pub tp_atr_mult: f64,
    pub min_tp_pct: f64,
    pub tp_update_interval_secs: i64,
    // Heikin-Ashi reversal exit
    pub ha_exit_enabled: bool,
    pub ha_exit_fraction: f64,
    pub ha_run_length: usize,
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            rsi_period: 14,
            atr_period: 14,
            bb_period: 20,
            bb_std_mult: 2.0,
            long_rsi_3m: 30.0,
            short_rsi_3m: 70.0,
            strong_long_rsi_1m: 25.0,
            strong_short_rsi_1m: 75.0,
            heavy_long_rsi_1m: 15.0,
            heavy_short_rsi_1m: 85.0,
            impulse_atr_mult: 1.5,
            max_dca: 3,
            dca_gaps: vec![1.0, 1.5, 2.0],
            dca_multiplier: 1.5,
            dca_long_rsi_1m: 35.0,
            dca_short_rsi_1m: 65.0,
            tp_atr_mult: 2.5,
            min_tp_pct: 0.01,
            tp_update_interval_secs: 60,
            ha_exit_enabled: false,
            ha_exit_fraction: 0.5,
            ha_run_length: 5,
        }
    }
}

impl StrategyParams {
    /// DCA gap multiple for the next leg
    ///
    /// Counts past the end of `dca_gaps` reuse the last gap.
    pub fn dca_gap(&self, dca_count: u32) -> f64 {
        let last = self.dca_gaps.len().saturating_sub(1);
        let idx = (dca_count as usize).min(last);
        self.dca_gaps.get(idx).copied().unwrap_or(1.0)
    }
}
