use crate::models::{Candle, Resolution};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SeriesError {
    #[error("series cache lock poisoned")]
    LockPoisoned,
    #[error("{to} is not a whole multiple of {from}")]
    IncompatibleResolution { from: Resolution, to: Resolution },
}

/// What an upsert did to the series
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Appended,
    Merged,
    Inserted,
}

type SeriesKey = (String, Resolution);

/// Thread-safe in-memory cache of candle series
///
/// Maintains a bounded, strictly time-ordered window of candles for each
/// (symbol, resolution). Candles are keyed by their aligned bucket open time.
#[derive(Clone)]
pub struct SeriesCache {
    data: Arc<RwLock<HashMap<SeriesKey, VecDeque<Candle>>>>,
    max_candles: usize,
}

impl SeriesCache {
    /// Create a new series cache
    ///
    /// # Arguments
    /// * `max_candles` - Maximum number of candles to keep per series
    pub fn new(max_candles: usize) -> Self {
        Self {
            data: Arc::new(RwLock::new(HashMap::new())),
            max_candles: max_candles.max(1),
        }
    }

    pub fn max_candles(&self) -> usize {
        self.max_candles
    }

    /// Insert or merge a candle
    ///
    /// Same bucket as the last candle replaces it in place (the live bar),
    /// a newer bucket is appended, and a late candle replaces its bucket or
    /// is inserted at its sorted position. Oldest candles are evicted past the cap.
    pub fn upsert(
        &self,
        symbol: &str,
        resolution: Resolution,
        mut candle: Candle,
    ) -> Result<Upsert, SeriesError> {
        candle.open_time = resolution.align(candle.open_time);

        let mut data = self.data.write().map_err(|_| SeriesError::LockPoisoned)?;
        let series = data
            .entry((symbol.to_string(), resolution))
            .or_insert_with(VecDeque::new);

        let last_time = series.back().map(|c| c.open_time);
        let outcome = match last_time {
            Some(last) if candle.open_time == last => {
                if let Some(slot) = series.back_mut() {
                    *slot = candle;
                }
                Upsert::Merged
            }
            Some(last) if candle.open_time < last => {
                match series.binary_search_by_key(&candle.open_time, |c| c.open_time) {
                    Ok(idx) => {
                        series[idx] = candle;
                        Upsert::Merged
                    }
                    Err(idx) => {
                        series.insert(idx, candle);
                        Upsert::Inserted
                    }
                }
            }
            _ => {
                series.push_back(candle);
                Upsert::Appended
            }
        };

        // Remove oldest if exceeds max
        while series.len() > self.max_candles {
            series.pop_front();
        }

        Ok(outcome)
    }

    /// Upsert a batch of candles in order
    pub fn extend(
        &self,
        symbol: &str,
        resolution: Resolution,
        candles: impl IntoIterator<Item = Candle>,
    ) -> Result<usize, SeriesError> {
        let mut count = 0;
        for candle in candles {
            self.upsert(symbol, resolution, candle)?;
            count += 1;
        }
        Ok(count)
    }

    /// Get the N most recent candles for a series
    pub fn window(
        &self,
        symbol: &str,
        resolution: Resolution,
        n: usize,
    ) -> Result<Vec<Candle>, SeriesError> {
        let data = self.data.read().map_err(|_| SeriesError::LockPoisoned)?;

        Ok(data
            .get(&(symbol.to_string(), resolution))
            .map(|deque| {
                let skip = deque.len().saturating_sub(n);
                deque.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default())
    }

    /// Get the whole series
    pub fn candles(&self, symbol: &str, resolution: Resolution) -> Result<Vec<Candle>, SeriesError> {
        self.window(symbol, resolution, usize::MAX)
    }

    /// Aggregate a cached series into a coarser resolution
    ///
    /// Returns an empty series when the source holds fewer candles than one
    /// target bucket needs; callers treat that as "not ready".
    pub fn resample(
        &self,
        symbol: &str,
        source: Resolution,
        target: Resolution,
    ) -> Result<Vec<Candle>, SeriesError> {
        let ratio = source
            .ratio_to(target)
            .ok_or(SeriesError::IncompatibleResolution {
                from: source,
                to: target,
            })?;

        let data = self.data.read().map_err(|_| SeriesError::LockPoisoned)?;
        let Some(series) = data.get(&(symbol.to_string(), source)) else {
            return Ok(Vec::new());
        };

        if series.len() < ratio {
            return Ok(Vec::new());
        }

        Ok(resample_candles(series.iter(), target))
    }

    /// Get count of candles for a series
    pub fn len(&self, symbol: &str, resolution: Resolution) -> Result<usize, SeriesError> {
        let data = self.data.read().map_err(|_| SeriesError::LockPoisoned)?;
        Ok(data
            .get(&(symbol.to_string(), resolution))
            .map(|d| d.len())
            .unwrap_or(0))
    }

    /// Get all symbols with at least one series
    pub fn symbols(&self) -> Result<Vec<String>, SeriesError> {
        let data = self.data.read().map_err(|_| SeriesError::LockPoisoned)?;
        let set: HashSet<&String> = data.keys().map(|(s, _)| s).collect();
        Ok(set.into_iter().cloned().collect())
    }

    /// Drop every series whose symbol is not in `keep`
    ///
    /// Returns how many series were evicted.
    pub fn retain_symbols(&self, keep: &HashSet<String>) -> Result<usize, SeriesError> {
        let mut data = self.data.write().map_err(|_| SeriesError::LockPoisoned)?;
        let before = data.len();
        data.retain(|(symbol, _), _| keep.contains(symbol));
        Ok(before - data.len())
    }

    /// Clear all data for a symbol
    pub fn clear_symbol(&self, symbol: &str) -> Result<(), SeriesError> {
        let mut data = self.data.write().map_err(|_| SeriesError::LockPoisoned)?;
        data.retain(|(s, _), _| s != symbol);
        Ok(())
    }
}

/// Aggregate time-ordered candles into `target` buckets
///
/// open = first open, high = max high, low = min low, close = last close,
/// volume = sum. Buckets without input candles are not emitted.
pub fn resample_candles<'a>(
    candles: impl IntoIterator<Item = &'a Candle>,
    target: Resolution,
) -> Vec<Candle> {
    let mut out: Vec<Candle> = Vec::new();

    for candle in candles {
        let bucket = target.align(candle.open_time);

        if let Some(current) = out.last_mut().filter(|c| c.open_time == bucket) {
            current.high = current.high.max(candle.high);
            current.low = current.low.min(candle.low);
            current.close = candle.close;
            current.volume += candle.volume;
            continue;
        }

        out.push(Candle {
            open_time: bucket,
            ..candle.clone()
        });
    }

    out
}
