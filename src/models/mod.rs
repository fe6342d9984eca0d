use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Candle resolution, stored as a number of seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Resolution(u32);

impl Resolution {
    pub const M1: Resolution = Resolution(60);
    pub const M3: Resolution = Resolution(180);
    pub const M5: Resolution = Resolution(300);
    pub const M15: Resolution = Resolution(900);
    pub const H1: Resolution = Resolution(3600);

    pub fn from_secs(secs: u32) -> Option<Self> {
        (secs > 0).then_some(Self(secs))
    }

    pub fn secs(&self) -> u32 {
        self.0
    }

    /// Floor a timestamp to the start of its bucket at this resolution
    pub fn align(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let secs = self.0 as i64;
        let aligned = ts.timestamp().div_euclid(secs) * secs;
        Utc.timestamp_opt(aligned, 0).single().unwrap_or(ts)
    }

    /// Number of `self` buckets that make up one `target` bucket
    ///
    /// Returns None unless `target` is a whole multiple of `self`.
    pub fn ratio_to(&self, target: Resolution) -> Option<usize> {
        if target.0 < self.0 || target.0 % self.0 != 0 {
            return None;
        }
        Some((target.0 / self.0) as usize)
    }

    /// Interval label used by exchange REST endpoints ("1m", "15m", "1h")
    pub fn label(&self) -> String {
        match self.0 {
            s if s % 86_400 == 0 => format!("{}d", s / 86_400),
            s if s % 3_600 == 0 => format!("{}h", s / 3_600),
            s if s % 60 == 0 => format!("{}m", s / 60),
            s => format!("{}s", s),
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// OHLCV candlestick, keyed by the open time of its bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Signed move of the bar (close - open)
    pub fn body(&self) -> f64 {
        self.close - self.open
    }
}

/// Position direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn opposite(&self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }

    /// +1 for long, -1 for short
    pub fn sign(&self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Long => f.write_str("LONG"),
            Side::Short => f.write_str("SHORT"),
        }
    }
}

/// Per-symbol trading constraints published by the exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub symbol: String,
    pub qty_precision: u32,
    pub price_precision: u32,
    pub min_qty: f64,
}

impl SymbolInfo {
    /// Smallest quantity increment
    pub fn qty_step(&self) -> f64 {
        10f64.powi(-(self.qty_precision as i32))
    }

    /// Round a quantity down to the quantity step
    ///
    /// A small epsilon keeps values like 0.999999999 from flooring one step short.
    pub fn floor_qty(&self, qty: f64) -> f64 {
        let scale = 10f64.powi(self.qty_precision as i32);
        ((qty * scale) + 1e-9).floor() / scale
    }

    /// Round a price to the price precision
    pub fn round_price(&self, price: f64) -> f64 {
        let scale = 10f64.powi(self.price_precision as i32);
        (price * scale).round() / scale
    }

    /// Whether `qty` is expressible with this symbol's precision
    pub fn is_qty_aligned(&self, qty: f64) -> bool {
        (self.floor_qty(qty) - qty).abs() < self.qty_step() / 2.0
    }
}

/// Open position held by the ledger
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub avg_entry_price: f64, // Volume-weighted across all fills
    pub dca_count: u32,
    pub last_tp_update: Option<DateTime<Utc>>,
}

impl Position {
    /// Distance price has travelled against the position (negative when in profit)
    pub fn adverse_move(&self, price: f64) -> f64 {
        (self.avg_entry_price - price) * self.side.sign()
    }

    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        (price - self.avg_entry_price) * self.quantity * self.side.sign()
    }
}

/// Ledger entry for a symbol
///
/// `Pending` holds the slot while an entry order is in flight or awaiting
/// its first reconciliation; nothing may read position fields from it.
#[derive(Debug, Clone, PartialEq)]
pub enum PositionState {
    Pending {
        side: Side,
        since: DateTime<Utc>,
    },
    Confirmed(Position),
}

impl PositionState {
    pub fn confirmed(&self) -> Option<&Position> {
        match self {
            PositionState::Confirmed(p) => Some(p),
            PositionState::Pending { .. } => None,
        }
    }

    pub fn side(&self) -> Side {
        match self {
            PositionState::Pending { side, .. } => *side,
            PositionState::Confirmed(p) => p.side,
        }
    }
}

/// Heikin-Ashi colour flip after a run of one colour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaFlip {
    TurnedBullish,
    TurnedBearish,
}

/// Indicator values for one symbol at one instant
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub rsi_1m: f64,
    pub rsi_3m: f64,
    pub atr_1m: f64,
    pub atr_15m: f64,
    pub bb_lower: f64,
    pub bb_upper: f64,
    pub price: f64,
    pub bar_move: f64, // close - open of the current 1m bar
    pub ha_flip: Option<HaFlip>,
}

/// Decision produced by the signal evaluator
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    NoOp,
    Enter(Side),
    ScaleIn,
    TakeProfitRefresh,
    PartialExit { fraction: f64 },
}

/// Durable per-symbol record that survives restarts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DcaRecord {
    pub side: Side,
    pub dca_count: u32,
}
