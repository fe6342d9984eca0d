use chrono::{DateTime, Utc};
use std::sync::{Arc, RwLock};

#[derive(Debug, Default)]
struct WatchlistInner {
    symbols: Arc<Vec<String>>,
    updated_at: Option<DateTime<Utc>>,
}

/// Symbols that passed the last slow-scan triage
///
/// Replaced wholesale when a slow scan completes; readers never see a
/// partially built list.
#[derive(Clone, Default)]
pub struct Watchlist {
    inner: Arc<RwLock<WatchlistInner>>,
}

impl Watchlist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&self, symbols: Vec<String>, at: DateTime<Utc>) {
        let mut inner = self.inner.write().unwrap_or_else(|p| p.into_inner());
        inner.symbols = Arc::new(symbols);
        inner.updated_at = Some(at);
    }

    pub fn snapshot(&self) -> Arc<Vec<String>> {
        self.inner
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .symbols
            .clone()
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.inner.read().unwrap_or_else(|p| p.into_inner()).updated_at
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.snapshot().iter().any(|s| s == symbol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replace_is_wholesale() {
        let watchlist = Watchlist::new();
        assert!(watchlist.is_empty());
        assert!(watchlist.updated_at().is_none());

        let now = Utc::now();
        watchlist.replace(vec!["A".into(), "B".into()], now);
        let before = watchlist.snapshot();

        watchlist.replace(vec!["C".into()], now);
        assert_eq!(before.as_slice(), ["A".to_string(), "B".to_string()]);
        assert!(watchlist.contains("C"));
        assert!(!watchlist.contains("A"));
        assert_eq!(watchlist.updated_at(), Some(now));
    }
}
