use chrono::{DateTime, Utc};

use super::StrategyParams;
use crate::models::{Action, HaFlip, MetricsSnapshot, Position, Side};

/// Decide what to do with a symbol given fresh metrics and its open position
///
/// Pure function: no I/O, no clock reads. Callers pass `now` so take-profit
/// throttling is deterministic.
///
/// Priority for an open position:
/// 1. Scale-in (position is losing and DCA budget remains)
/// 2. Heikin-Ashi partial exit (position is winning, feature enabled)
/// 3. Take-profit refresh (throttled by `tp_update_interval_secs`)
pub fn evaluate(
    metrics: &MetricsSnapshot,
    position: Option<&Position>,
    params: &StrategyParams,
    now: DateTime<Utc>,
) -> Action {
    match position {
        None => evaluate_entry(metrics, params),
        Some(position) => evaluate_open_position(metrics, position, params, now),
    }
}

fn evaluate_entry(m: &MetricsSnapshot, params: &StrategyParams) -> Action {
    let impulse = params.impulse_atr_mult * m.atr_1m;

    let long = m.rsi_3m < params.long_rsi_3m
        && m.price < m.bb_lower
        && m.rsi_1m < params.strong_long_rsi_1m
        && -m.bar_move > impulse;

    if long {
        tracing::debug!(
            symbol = %m.symbol,
            rsi_3m = m.rsi_3m,
            rsi_1m = m.rsi_1m,
            "Long entry conditions met"
        );
        return Action::Enter(Side::Long);
    }

    let short = m.rsi_3m > params.short_rsi_3m
        && m.price > m.bb_upper
        && m.rsi_1m > params.strong_short_rsi_1m
        && m.bar_move > impulse;

    if short {
        tracing::debug!(
            symbol = %m.symbol,
            rsi_3m = m.rsi_3m,
            rsi_1m = m.rsi_1m,
            "Short entry conditions met"
        );
        return Action::Enter(Side::Short);
    }

    Action::NoOp
}

/// Whether an entry signal is extreme enough for the larger entry size
pub fn is_heavy_entry(m: &MetricsSnapshot, side: Side, params: &StrategyParams) -> bool {
    match side {
        Side::Long => m.rsi_1m < params.heavy_long_rsi_1m,
        Side::Short => m.rsi_1m > params.heavy_short_rsi_1m,
    }
}

fn evaluate_open_position(
    m: &MetricsSnapshot,
    position: &Position,
    params: &StrategyParams,
    now: DateTime<Utc>,
) -> Action {
    if position.dca_count < params.max_dca && should_scale_in(m, position, params) {
        return Action::ScaleIn;
    }

    if params.ha_exit_enabled && should_take_partial(m, position) {
        return Action::PartialExit {
            fraction: params.ha_exit_fraction,
        };
    }

    let tp_due = match position.last_tp_update {
        None => true,
        Some(last) => (now - last).num_seconds() >= params.tp_update_interval_secs,
    };

    if tp_due {
        Action::TakeProfitRefresh
    } else {
        Action::NoOp
    }
}

fn should_scale_in(m: &MetricsSnapshot, position: &Position, params: &StrategyParams) -> bool {
    let adverse = position.adverse_move(m.price);

    // Condition 1: price has run far enough against us
    let gap = params.dca_gap(position.dca_count) * m.atr_15m;
    if adverse > 0.0 && adverse >= gap {
        return true;
    }

    // Condition 2: already underwater and a fresh reversal signal fires
    let reversal = match position.side {
        Side::Long => m.rsi_1m < params.dca_long_rsi_1m && m.price < m.bb_lower,
        Side::Short => m.rsi_1m > params.dca_short_rsi_1m && m.price > m.bb_upper,
    };

    adverse > 0.0 && reversal
}

fn should_take_partial(m: &MetricsSnapshot, position: &Position) -> bool {
    let in_profit = position.adverse_move(m.price) < 0.0;

    let against = match (position.side, m.ha_flip) {
        (Side::Long, Some(HaFlip::TurnedBearish)) => true,
        (Side::Short, Some(HaFlip::TurnedBullish)) => true,
        _ => false,
    };

    in_profit && against
}
