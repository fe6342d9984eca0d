// Market state: candle series, symbol constraints, chart transforms
pub mod catalog;
pub mod heikin_ashi;
pub mod series_cache;

pub use catalog::{CatalogError, SymbolCatalog};
pub use heikin_ashi::{detect_flip, heikin_ashi, HaCandle};
pub use series_cache::{resample_candles, SeriesCache, SeriesError, Upsert};
