// Engine: owns the shared state and drives every background loop
pub mod shutdown;

pub use shutdown::Shutdown;

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use crate::api::{AccountClient, MarketDataSource};
use crate::config::Settings;
use crate::execution::{
    CooldownMap, ExecutionCoordinator, PositionLedger, ReconcileReport, Reconciler,
};
use crate::indicators::MetricsEngine;
use crate::market::{CatalogError, SeriesCache, SymbolCatalog};
use crate::models::Resolution;
use crate::persistence::SnapshotStore;
use crate::scheduler::{
    fast_scan, slow_scan, FastScanReport, FastScanner, FocusSelector, ScanError, SlowScanReport,
    Watchlist,
};

/// What a single slow + fast pass did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub slow: SlowScanReport,
    pub fast: FastScanReport,
}

/// The trading engine
///
/// Every piece of shared state lives here behind an `Arc`; loops receive a
/// clone of the engine and never hold a lock across an `.await`.
pub struct Engine {
    settings: Settings,
    market: Arc<dyn MarketDataSource>,
    account: Arc<dyn AccountClient>,
    store: Arc<dyn SnapshotStore>,
    cache: SeriesCache,
    catalog: SymbolCatalog,
    metrics: Arc<MetricsEngine>,
    ledger: Arc<Mutex<PositionLedger>>,
    cooldowns: Arc<Mutex<CooldownMap>>,
    watchlist: Watchlist,
    focus: Mutex<FocusSelector>,
    focus_tx: watch::Sender<Vec<String>>,
    scanner: Arc<FastScanner>,
    reconciler: Reconciler,
}

impl Engine {
    /// Wire up an engine
    ///
    /// `cache` and `catalog` are passed in so a paper account can share them.
    pub fn new(
        settings: Settings,
        market: Arc<dyn MarketDataSource>,
        account: Arc<dyn AccountClient>,
        store: Arc<dyn SnapshotStore>,
        cache: SeriesCache,
        catalog: SymbolCatalog,
    ) -> Self {
        let ledger = Arc::new(Mutex::new(PositionLedger::new(settings.strategy.max_dca)));
        let cooldowns = Arc::new(Mutex::new(CooldownMap::new()));
        let metrics = Arc::new(MetricsEngine::new(chrono::Duration::seconds(
            settings.series.metrics_ttl_secs,
        )));

        let coordinator = Arc::new(ExecutionCoordinator::new(
            account.clone(),
            market.clone(),
            catalog.clone(),
            ledger.clone(),
            cooldowns.clone(),
            store.clone(),
            settings.execution.clone(),
            settings.strategy.clone(),
        ));

        let scanner = Arc::new(FastScanner {
            market: market.clone(),
            cache: cache.clone(),
            metrics: metrics.clone(),
            coordinator,
            ledger: ledger.clone(),
            params: settings.strategy.clone(),
            series: settings.series.clone(),
            symbol_limit: settings.execution.symbol_limit,
        });

        let reconciler = Reconciler::new(
            account.clone(),
            market.clone(),
            catalog.clone(),
            ledger.clone(),
            store.clone(),
        );

        let focus = FocusSelector::new(settings.scan.fast_cap, settings.scan.overflow_policy);
        let (focus_tx, _) = watch::channel(Vec::new());

        Self {
            settings,
            market,
            account,
            store,
            cache,
            catalog,
            metrics,
            ledger,
            cooldowns,
            watchlist: Watchlist::new(),
            focus: Mutex::new(focus),
            focus_tx,
            scanner,
            reconciler,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn catalog(&self) -> &SymbolCatalog {
        &self.catalog
    }

    pub fn cache(&self) -> &SeriesCache {
        &self.cache
    }

    pub fn watchlist(&self) -> &Watchlist {
        &self.watchlist
    }

    /// Lock the position ledger (recovers from poisoning)
    pub fn ledger(&self) -> MutexGuard<'_, PositionLedger> {
        self.ledger.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn cooldowns(&self) -> MutexGuard<'_, CooldownMap> {
        self.cooldowns.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Subscribe to focus set changes
    pub fn subscribe_focus(&self) -> watch::Receiver<Vec<String>> {
        self.focus_tx.subscribe()
    }

    // ========================================================================
    // Cycle steps
    // ========================================================================

    /// Load the universe, restore DCA counters and adopt broker positions
    ///
    /// Fails when the universe or the account cannot be reached.
    pub async fn startup(&self) -> crate::Result<()> {
        tracing::info!("🔍 Loading contract universe...");
        let held = self.ledger().held_symbols();
        let count = self.catalog.refresh_all(self.market.as_ref(), &held).await?;
        tracing::info!("✓ {} tradable symbols", count);

        let equity = self.account.fetch_equity().await?;
        tracing::info!(
            "💰 Equity: ${:.2} (available ${:.2})",
            equity.total,
            equity.available
        );

        if let Err(e) = self.reconciler.restore().await {
            tracing::warn!("Failed to load DCA snapshot, starting from broker state: {}", e);
        }

        let report = self.reconciler.reconcile(Utc::now()).await?;
        tracing::info!(
            "✓ Reconciled {} open positions ({} adopted)",
            report.held,
            report.adopted.len()
        );
        Ok(())
    }

    /// Triage the universe and swap in a new watchlist
    pub async fn run_slow_scan(&self, now: DateTime<Utc>) -> Result<SlowScanReport, ScanError> {
        let symbols = self.catalog.symbols();
        let report = slow_scan(
            self.market.clone(),
            &symbols,
            &self.settings.scan,
            self.settings.strategy.rsi_period,
        )
        .await?;

        self.watchlist.replace(report.watchlist.clone(), now);
        self.prune_series();

        tracing::info!(
            "🔍 Slow scan: {}/{} symbols on watchlist ({} not ready, {} failed)",
            report.watchlist.len(),
            report.scanned,
            report.not_ready,
            report.failed
        );
        Ok(report)
    }

    /// Drop cached series for symbols that are neither watched nor held
    fn prune_series(&self) {
        let mut keep: HashSet<String> = self.watchlist.snapshot().iter().cloned().collect();
        keep.extend(self.ledger().held_symbols());

        match self.cache.retain_symbols(&keep) {
            Ok(0) => {}
            Ok(dropped) => tracing::debug!(dropped, "Pruned idle series"),
            Err(e) => tracing::error!("Series prune failed: {}", e),
        }
        self.metrics.retain(&keep);
    }

    /// Pick this cycle's fast-scan symbols and publish them if they changed
    pub fn select_focus(&self) -> Vec<String> {
        let held = self.ledger().held_symbols();
        let watchlist = self.watchlist.snapshot();
        let focus = self
            .focus
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .select(&held, &watchlist);

        self.focus_tx.send_if_modified(|current| {
            let mut next = focus.clone();
            next.sort();
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        focus
    }

    /// Evaluate and act on the focus set
    pub async fn run_fast_scan(&self, now: DateTime<Utc>) -> Result<FastScanReport, ScanError> {
        let focus = self.select_focus();
        if focus.is_empty() {
            return Ok(FastScanReport::default());
        }

        let report = fast_scan(self.scanner.clone(), focus, now).await?;
        for (symbol, action) in &report.actions {
            tracing::info!("💹 {} -> {:?}", symbol, action);
        }
        if !report.rejected.is_empty() {
            tracing::debug!(rejected = report.rejected.len(), "Actions not carried out this pass");
        }
        Ok(report)
    }

    /// One slow scan followed by one fast scan
    pub async fn run_once(&self) -> crate::Result<CycleReport> {
        let slow = self.run_slow_scan(Utc::now()).await?;
        let fast = self.run_fast_scan(Utc::now()).await?;
        Ok(CycleReport { slow, fast })
    }

    pub async fn reconcile(&self, now: DateTime<Utc>) -> crate::Result<ReconcileReport> {
        let report = self.reconciler.reconcile(now).await?;
        for symbol in &report.removed {
            self.metrics.evict(symbol);
        }
        Ok(report)
    }

    /// Reload the universe and forget series of delisted symbols
    ///
    /// Held symbols keep their constraints and series until the position is
    /// gone.
    pub async fn refresh_catalog(&self) -> Result<usize, CatalogError> {
        let before = self.catalog.symbols();
        let held = self.ledger().held_symbols();
        let count = self.catalog.refresh_all(self.market.as_ref(), &held).await?;

        for symbol in before
            .iter()
            .filter(|s| !self.catalog.contains(s) && !held.contains(s))
        {
            tracing::info!("🗑 {} delisted, dropping cached series", symbol);
            if let Err(e) = self.cache.clear_symbol(symbol) {
                tracing::error!(symbol = %symbol, "Series clear failed: {}", e);
            }
            self.metrics.evict(symbol);
        }
        Ok(count)
    }

    /// Log equity, positions, watchlist size and cooldowns
    pub async fn heartbeat(&self, now: DateTime<Utc>) {
        let expired = self.cooldowns().prune(now);
        let cooling = self.cooldowns().len();

        let positions: Vec<String> = self
            .ledger()
            .positions()
            .iter()
            .map(|p| {
                format!(
                    "{} {} {} @ {} (dca {})",
                    p.symbol, p.side, p.quantity, p.avg_entry_price, p.dca_count
                )
            })
            .collect();

        match self.account.fetch_equity().await {
            Ok(equity) => tracing::info!(
                "💓 Equity ${:.2} (available ${:.2}) | {} positions | watchlist {} | {} cooling down",
                equity.total,
                equity.available,
                positions.len(),
                self.watchlist.len(),
                cooling
            ),
            Err(e) => tracing::warn!("💓 Heartbeat could not fetch equity: {}", e),
        }

        for line in &positions {
            tracing::info!("  📈 {}", line);
        }
        if expired > 0 {
            tracing::debug!(expired, "Cooldowns expired");
        }
    }

    /// Persist the current ledger snapshot
    pub async fn flush(&self) {
        let snapshot = self.ledger().snapshot();
        if let Err(e) = self.store.save(&snapshot).await {
            tracing::warn!("Failed to persist DCA snapshot: {}", e);
        }
    }

    // ========================================================================
    // Background loops
    // ========================================================================

    /// Spawn every loop and wait until all of them stop
    pub async fn run(self: Arc<Self>, shutdown: Shutdown) {
        let mut loops = JoinSet::new();
        loops.spawn(self.clone().slow_scan_loop(shutdown.clone()));
        loops.spawn(self.clone().fast_scan_loop(shutdown.clone()));
        loops.spawn(self.clone().reconcile_loop(shutdown.clone()));
        loops.spawn(self.clone().heartbeat_loop(shutdown.clone()));
        loops.spawn(self.clone().catalog_loop(shutdown.clone()));
        loops.spawn(self.clone().ingest_loop(shutdown.clone()));

        tracing::info!("✅ All loops spawned");
        tracing::info!("  🔍 Slow scan: every {}s", self.settings.scan.slow_interval_secs);
        tracing::info!("  💹 Fast scan: every {}s", self.settings.scan.fast_interval_secs);
        tracing::info!("  🔄 Reconcile: every {}s", self.settings.scan.reconcile_interval_secs);

        while let Some(joined) = loops.join_next().await {
            if let Err(e) = joined {
                tracing::error!("Loop task failed: {}", e);
            }
        }

        self.flush().await;
        tracing::info!("All loops stopped");
    }

    async fn slow_scan_loop(self: Arc<Self>, shutdown: Shutdown) {
        let mut ticker = skip_interval(self.settings.scan.slow_interval(), false);
        let mut retry = false;

        loop {
            // A failed scan retries after the backoff instead of a full interval
            if !retry {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = ticker.tick() => {}
                }
            }

            retry = match self.run_slow_scan(Utc::now()).await {
                Ok(_) => false,
                Err(e) => {
                    tracing::warn!(
                        "✗ Slow scan failed: {}, retrying in {}s",
                        e,
                        self.settings.scan.error_backoff_secs
                    );
                    if !backoff(&shutdown, self.settings.scan.error_backoff()).await {
                        break;
                    }
                    true
                }
            };
        }
    }

    async fn fast_scan_loop(self: Arc<Self>, shutdown: Shutdown) {
        let mut ticker = skip_interval(self.settings.scan.fast_interval(), false);

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.run_fast_scan(Utc::now()).await {
                tracing::warn!(
                    "✗ Fast scan failed: {}, retrying in {}s",
                    e,
                    self.settings.scan.error_backoff_secs
                );
                if !backoff(&shutdown, self.settings.scan.error_backoff()).await {
                    break;
                }
            }
        }
    }

    async fn reconcile_loop(self: Arc<Self>, shutdown: Shutdown) {
        let period = Duration::from_secs(self.settings.scan.reconcile_interval_secs);
        let mut ticker = skip_interval(period, true);

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => {}
            }

            match self.reconcile(Utc::now()).await {
                Ok(report) => {
                    for symbol in &report.adopted {
                        tracing::info!("🔄 Adopted broker position {}", symbol);
                    }
                    for symbol in &report.removed {
                        tracing::info!("🔄 Position {} closed at broker", symbol);
                    }
                }
                Err(e) => tracing::warn!("✗ Reconcile failed: {}", e),
            }
        }
    }

    async fn heartbeat_loop(self: Arc<Self>, shutdown: Shutdown) {
        let period = Duration::from_secs(self.settings.scan.heartbeat_interval_secs);
        let mut ticker = skip_interval(period, true);

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => {}
            }
            self.heartbeat(Utc::now()).await;
        }
    }

    async fn catalog_loop(self: Arc<Self>, shutdown: Shutdown) {
        let period = Duration::from_secs(self.settings.scan.catalog_refresh_secs);
        let mut ticker = skip_interval(period, true);

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => {}
            }

            // A failed refresh keeps the previous catalog
            if let Err(e) = self.refresh_catalog().await {
                tracing::warn!("✗ Catalog refresh failed: {}", e);
            }
        }
    }

    /// Feed streamed 1m candles into the series cache
    ///
    /// Resubscribes whenever the published focus set changes.
    async fn ingest_loop(self: Arc<Self>, shutdown: Shutdown) {
        let mut focus_rx = self.subscribe_focus();
        let retry = Duration::from_secs(self.settings.exchange.stream_poll_secs.max(1));

        loop {
            let symbols = focus_rx.borrow_and_update().clone();

            if symbols.is_empty() {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    changed = focus_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                }
            }

            let mut stream = match self.market.stream_candles(symbols.clone()).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!("✗ Candle stream failed to start: {}", e);
                    if !backoff(&shutdown, retry).await {
                        break;
                    }
                    continue;
                }
            };
            tracing::debug!(symbols = symbols.len(), "Candle stream subscribed");

            loop {
                tokio::select! {
                    _ = shutdown.wait() => return,
                    changed = focus_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        break;
                    }
                    next = stream.recv() => match next {
                        Some((symbol, candle)) => {
                            if let Err(e) = self.cache.upsert(&symbol, Resolution::M1, candle) {
                                tracing::error!(symbol = %symbol, "Series cache update failed: {}", e);
                            }
                        }
                        None => {
                            tracing::warn!("Candle stream closed, resubscribing");
                            if !backoff(&shutdown, retry).await {
                                return;
                            }
                            break;
                        }
                    }
                }
            }
        }
    }
}

/// Interval that skips missed ticks
///
/// With `delay_first` the first tick fires one period from now instead of
/// immediately.
fn skip_interval(period: Duration, delay_first: bool) -> Interval {
    let period = period.max(Duration::from_millis(1));
    let start = if delay_first {
        Instant::now() + period
    } else {
        Instant::now()
    };
    let mut ticker = interval_at(start, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

/// Sleep for `delay` unless shutdown comes first; false means stop
async fn backoff(shutdown: &Shutdown, delay: Duration) -> bool {
    tokio::select! {
        _ = shutdown.wait() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
