// Two-tier scan scheduling: slow universe triage, fast focused evaluation
pub mod fast_scan;
pub mod focus;
pub mod slow_scan;
pub mod watchlist;

pub use fast_scan::{fast_scan, FastScanReport, FastScanner};
pub use focus::FocusSelector;
pub use slow_scan::{slow_scan, SlowScanReport};
pub use watchlist::Watchlist;

/// Failure that aborts a whole scan cycle
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScanError {
    #[error("no symbols to scan")]
    EmptyUniverse,
    #[error("all {0} candle requests failed")]
    Unreachable(usize),
}
