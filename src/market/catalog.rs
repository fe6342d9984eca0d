use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use crate::api::{BrokerError, MarketDataSource};
use crate::models::SymbolInfo;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CatalogError {
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("exchange returned an empty universe")]
    EmptyUniverse,
}

type CatalogMap = Arc<HashMap<String, SymbolInfo>>;

/// Per-symbol trading constraints
///
/// Readers take a cheap `Arc` snapshot; writers build a new map and swap it
/// in with a single assignment, so nobody observes a half-refreshed catalog.
#[derive(Clone, Default)]
pub struct SymbolCatalog {
    inner: Arc<RwLock<CatalogMap>>,
}

impl SymbolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current catalog contents
    pub fn snapshot(&self) -> CatalogMap {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn get(&self, symbol: &str) -> Option<SymbolInfo> {
        self.snapshot().get(symbol).cloned()
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.snapshot().contains_key(symbol)
    }

    /// All tradable symbols, sorted for stable batching
    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.snapshot().keys().cloned().collect();
        symbols.sort();
        symbols
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Replace the whole catalog
    pub fn replace(&self, infos: Vec<SymbolInfo>) {
        let map: HashMap<String, SymbolInfo> = infos
            .into_iter()
            .map(|info| (info.symbol.clone(), info))
            .collect();

        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(map);
    }

    /// Insert or overwrite a single symbol (copy-on-write)
    pub fn upsert(&self, info: SymbolInfo) {
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut map = HashMap::clone(&guard);
        map.insert(info.symbol.clone(), info);
        *guard = Arc::new(map);
    }

    /// Reload the full universe from the exchange
    ///
    /// The existing catalog is kept when the fetch fails or comes back empty.
    /// Symbols in `held` that dropped out of the universe keep their previous
    /// constraints so open positions can still be managed. Returns the number
    /// of listed symbols.
    pub async fn refresh_all(
        &self,
        source: &dyn MarketDataSource,
        held: &[String],
    ) -> Result<usize, CatalogError> {
        let mut infos = source.fetch_universe().await?;
        if infos.is_empty() {
            return Err(CatalogError::EmptyUniverse);
        }

        let count = infos.len();
        let listed: HashSet<String> = infos.iter().map(|info| info.symbol.clone()).collect();
        let previous = self.snapshot();
        for symbol in held.iter().filter(|s| !listed.contains(s.as_str())) {
            if let Some(info) = previous.get(symbol) {
                tracing::warn!(symbol = %symbol, "Held symbol left the universe, keeping its constraints");
                infos.push(info.clone());
            }
        }

        self.replace(infos);
        tracing::info!(count, "Symbol catalog refreshed");
        Ok(count)
    }

    /// Refetch constraints for one symbol after the exchange rejected them
    pub async fn refresh_symbol(
        &self,
        source: &dyn MarketDataSource,
        symbol: &str,
    ) -> Result<Option<SymbolInfo>, CatalogError> {
        let info = source.fetch_symbol(symbol).await?;

        match &info {
            Some(info) => {
                tracing::info!(
                    symbol,
                    qty_precision = info.qty_precision,
                    min_qty = info.min_qty,
                    "Symbol constraints refreshed"
                );
                self.upsert(info.clone());
            }
            None => tracing::warn!(symbol, "Symbol no longer listed"),
        }

        Ok(info)
    }
}
