use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{CooldownMap, PositionLedger};
use crate::api::{AccountClient, BrokerError, MarketDataSource, OrderAck};
use crate::config::ExecutionSettings;
use crate::market::SymbolCatalog;
use crate::models::{Action, MetricsSnapshot, Position, Side, SymbolInfo};
use crate::persistence::SnapshotStore;
use crate::strategy::{
    entry_quantity, is_heavy_entry, scale_in_quantity, take_profit_price, SizingError,
    StrategyParams,
};

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("{symbol} is cooling down until {until}")]
    CoolingDown {
        symbol: String,
        until: DateTime<Utc>,
    },
    #[error("no constraints known for {0}")]
    UnknownSymbol(String),
    #[error("symbol limit reached ({0})")]
    SymbolLimit(usize),
    #[error("no confirmed position for {0}")]
    NoPosition(String),
    #[error("order value {notional:.2} below minimum {min:.2}")]
    BelowMinNotional { notional: f64, min: f64 },
    #[error(transparent)]
    Sizing(#[from] SizingError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("ledger rejected update: {0}")]
    Ledger(String),
}

impl ExecutionError {
    /// Expected conditions that should not be logged as failures
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            ExecutionError::CoolingDown { .. } | ExecutionError::SymbolLimit(_)
        )
    }
}

/// What an executed action did
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Skipped,
    Entered { qty: f64, price: f64 },
    EntryPending { order_id: String },
    ScaledIn { qty: f64, price: f64 },
    TakeProfitPlaced { price: f64 },
    Reduced { qty: f64, closed: bool },
}

/// Turns evaluator actions into orders and keeps the ledger in step
///
/// Ledger and cooldown locks are only ever held between awaits.
pub struct ExecutionCoordinator {
    account: Arc<dyn AccountClient>,
    market: Arc<dyn MarketDataSource>,
    catalog: SymbolCatalog,
    ledger: Arc<Mutex<PositionLedger>>,
    cooldowns: Arc<Mutex<CooldownMap>>,
    store: Arc<dyn SnapshotStore>,
    settings: ExecutionSettings,
    params: StrategyParams,
}

impl ExecutionCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        account: Arc<dyn AccountClient>,
        market: Arc<dyn MarketDataSource>,
        catalog: SymbolCatalog,
        ledger: Arc<Mutex<PositionLedger>>,
        cooldowns: Arc<Mutex<CooldownMap>>,
        store: Arc<dyn SnapshotStore>,
        settings: ExecutionSettings,
        params: StrategyParams,
    ) -> Self {
        Self {
            account,
            market,
            catalog,
            ledger,
            cooldowns,
            store,
            settings,
            params,
        }
    }

    fn ledger(&self) -> MutexGuard<'_, PositionLedger> {
        self.ledger.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn cooldowns(&self) -> MutexGuard<'_, CooldownMap> {
        self.cooldowns.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Execute one evaluator decision for the symbol in `metrics`
    pub async fn apply(
        &self,
        metrics: &MetricsSnapshot,
        action: &Action,
        now: DateTime<Utc>,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        match action {
            Action::NoOp => Ok(ExecutionOutcome::Skipped),
            Action::Enter(side) => self.enter(metrics, *side, now).await,
            Action::ScaleIn => self.scale_in(metrics, now).await,
            Action::TakeProfitRefresh => self.refresh_take_profit(metrics, now).await,
            Action::PartialExit { fraction } => self.partial_exit(metrics, *fraction, now).await,
        }
    }

    fn check_cooldown(&self, symbol: &str, now: DateTime<Utc>) -> Result<(), ExecutionError> {
        match self.cooldowns().active_until(symbol, now) {
            Some(until) => Err(ExecutionError::CoolingDown {
                symbol: symbol.to_string(),
                until,
            }),
            None => Ok(()),
        }
    }

    fn symbol_info(&self, symbol: &str) -> Result<SymbolInfo, ExecutionError> {
        self.catalog
            .get(symbol)
            .ok_or_else(|| ExecutionError::UnknownSymbol(symbol.to_string()))
    }

    fn confirmed(&self, symbol: &str) -> Result<Position, ExecutionError> {
        self.ledger()
            .position(symbol)
            .cloned()
            .ok_or_else(|| ExecutionError::NoPosition(symbol.to_string()))
    }

    fn check_min_notional(&self, qty: f64, price: f64) -> Result<(), ExecutionError> {
        let notional = qty * price;
        if notional < self.settings.min_notional {
            return Err(ExecutionError::BelowMinNotional {
                notional,
                min: self.settings.min_notional,
            });
        }
        Ok(())
    }

    /// Place a market order
    ///
    /// Opening orders first set leverage (best effort). Broker failures are
    /// classified: stale constraints refresh the symbol and start a cooldown,
    /// rate limits start a cooldown, everything else is just reported.
    pub async fn place(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        reduce_only: bool,
        now: DateTime<Utc>,
    ) -> Result<OrderAck, ExecutionError> {
        self.check_cooldown(symbol, now)?;

        if !reduce_only {
            if let Err(e) = self.account.set_leverage(symbol, self.settings.leverage).await {
                tracing::warn!(symbol, "Failed to set leverage {}x: {}", self.settings.leverage, e);
            }
        }

        match self
            .account
            .place_market_order(symbol, side, qty, reduce_only)
            .await
        {
            Ok(ack) => Ok(ack),
            Err(e) => {
                self.handle_broker_error(symbol, &e, now).await;
                Err(e.into())
            }
        }
    }

    async fn handle_broker_error(&self, symbol: &str, error: &BrokerError, now: DateTime<Utc>) {
        if error.needs_catalog_refresh() {
            if let Err(e) = self
                .catalog
                .refresh_symbol(self.market.as_ref(), symbol)
                .await
            {
                tracing::warn!(symbol, "Constraint refresh failed: {}", e);
            }
        }

        if error.needs_cooldown() {
            let resume = self.cooldowns().install(
                symbol,
                now,
                Duration::seconds(self.settings.cooldown_secs),
            );
            tracing::warn!(symbol, %resume, "⏸ Order failed, cooling down: {}", error);
            return;
        }

        match error {
            BrokerError::InsufficientBalance(_) => {
                tracing::warn!(symbol, "Order skipped: {}", error)
            }
            _ => tracing::error!(symbol, "Order failed: {}", error),
        }
    }

    /// Open a new position
    ///
    /// The ledger slot is reserved before any I/O and released again if the
    /// order does not go through. An acknowledged order without a fill price
    /// keeps the slot pending until the reconciler sees the position.
    pub async fn enter(
        &self,
        metrics: &MetricsSnapshot,
        side: Side,
        now: DateTime<Utc>,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        let symbol = metrics.symbol.as_str();
        self.check_cooldown(symbol, now)?;
        let info = self.symbol_info(symbol)?;

        {
            let mut ledger = self.ledger();
            if !ledger.contains(symbol) && ledger.open_count() >= self.settings.symbol_limit {
                return Err(ExecutionError::SymbolLimit(self.settings.symbol_limit));
            }
            ledger
                .try_reserve(symbol, side, self.settings.symbol_limit, now)
                .map_err(|e| ExecutionError::Ledger(e.to_string()))?;
        }

        match self.submit_entry(metrics, side, &info, now).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.ledger().release(symbol);
                Err(e)
            }
        }
    }

    async fn submit_entry(
        &self,
        metrics: &MetricsSnapshot,
        side: Side,
        info: &SymbolInfo,
        now: DateTime<Utc>,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        let symbol = metrics.symbol.as_str();

        let percent = if is_heavy_entry(metrics, side, &self.params) {
            tracing::info!(symbol, rsi_1m = metrics.rsi_1m, "🎯 Strong signal, sizing up entry");
            self.settings.strong_entry_percent
        } else {
            self.settings.entry_percent
        };

        let equity = self.account.fetch_equity().await?;
        let qty = entry_quantity(
            equity.available,
            percent,
            self.settings.min_notional,
            metrics.price,
            info,
        )?;
        self.check_min_notional(qty, metrics.price)?;

        let ack = self.place(symbol, side, qty, false, now).await?;
        let filled = if ack.filled_qty > 0.0 { ack.filled_qty } else { qty };

        let Some(price) = ack.avg_price else {
            tracing::info!(symbol, order_id = %ack.order_id, "Entry acknowledged, awaiting fill");
            return Ok(ExecutionOutcome::EntryPending {
                order_id: ack.order_id,
            });
        };

        self.ledger()
            .confirm_entry(symbol, side, filled, price)
            .map_err(|e| ExecutionError::Ledger(e.to_string()))?;
        self.persist().await;

        Ok(ExecutionOutcome::Entered { qty: filled, price })
    }

    /// Add a DCA leg of `held * dca_multiplier`
    pub async fn scale_in(
        &self,
        metrics: &MetricsSnapshot,
        now: DateTime<Utc>,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        let symbol = metrics.symbol.as_str();
        self.check_cooldown(symbol, now)?;
        let info = self.symbol_info(symbol)?;
        let position = self.confirmed(symbol)?;

        if position.dca_count >= self.params.max_dca {
            return Err(ExecutionError::Ledger(format!(
                "DCA limit reached for {}",
                symbol
            )));
        }

        let qty = scale_in_quantity(position.quantity, self.params.dca_multiplier, &info);
        if qty < info.min_qty || qty <= 0.0 {
            return Err(SizingError::BelowMinQty {
                qty,
                min_qty: info.min_qty,
            }
            .into());
        }
        self.check_min_notional(qty, metrics.price)?;

        let ack = self.place(symbol, position.side, qty, false, now).await?;
        let filled = if ack.filled_qty > 0.0 { ack.filled_qty } else { qty };
        // Reconciliation corrects the average if the real fill differs
        let price = ack.avg_price.unwrap_or(metrics.price);

        self.ledger()
            .scale_in(symbol, filled, price)
            .map_err(|e| ExecutionError::Ledger(e.to_string()))?;
        self.persist().await;

        Ok(ExecutionOutcome::ScaledIn { qty: filled, price })
    }

    /// Replace the reduce-only take-profit order
    ///
    /// Existing orders are cancelled first; if the cancel fails nothing new
    /// is placed so orders never stack.
    pub async fn refresh_take_profit(
        &self,
        metrics: &MetricsSnapshot,
        now: DateTime<Utc>,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        let symbol = metrics.symbol.as_str();
        self.check_cooldown(symbol, now)?;
        let info = self.symbol_info(symbol)?;
        let position = self.confirmed(symbol)?;

        let target = take_profit_price(
            position.side,
            position.avg_entry_price,
            metrics.atr_15m,
            self.params.tp_atr_mult,
            self.params.min_tp_pct,
        );
        let price = info.round_price(target);
        let qty = info.floor_qty(position.quantity);

        if let Err(e) = self.account.cancel_all_orders(symbol).await {
            self.handle_broker_error(symbol, &e, now).await;
            return Err(e.into());
        }

        if let Err(e) = self
            .account
            .place_limit_order(symbol, position.side.opposite(), qty, price, true)
            .await
        {
            self.handle_broker_error(symbol, &e, now).await;
            return Err(e.into());
        }

        self.ledger()
            .mark_tp_updated(symbol, now)
            .map_err(|e| ExecutionError::Ledger(e.to_string()))?;

        tracing::info!(
            symbol,
            side = %position.side,
            avg = position.avg_entry_price,
            target = price,
            "🎯 Take profit set"
        );
        Ok(ExecutionOutcome::TakeProfitPlaced { price })
    }

    /// Close `fraction` of a position with a reduce-only market order
    ///
    /// A fraction too small to trade closes the whole position.
    pub async fn partial_exit(
        &self,
        metrics: &MetricsSnapshot,
        fraction: f64,
        now: DateTime<Utc>,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        let symbol = metrics.symbol.as_str();
        self.check_cooldown(symbol, now)?;
        let info = self.symbol_info(symbol)?;
        let position = self.confirmed(symbol)?;

        let mut qty = info.floor_qty(position.quantity * fraction.clamp(0.0, 1.0));
        if qty < info.min_qty || qty <= 0.0 {
            qty = position.quantity;
        }

        let ack = self
            .place(symbol, position.side.opposite(), qty, true, now)
            .await?;
        let filled = if ack.filled_qty > 0.0 { ack.filled_qty } else { qty };

        let remaining = self
            .ledger()
            .reduce(symbol, filled)
            .map_err(|e| ExecutionError::Ledger(e.to_string()))?;
        let closed = remaining.is_none();

        if closed {
            if let Err(e) = self.account.cancel_all_orders(symbol).await {
                tracing::warn!(symbol, "Failed to cancel leftover orders: {}", e);
            }
        }
        self.persist().await;

        tracing::info!(symbol, qty = filled, closed, "💰 Partial exit on Heikin-Ashi flip");
        Ok(ExecutionOutcome::Reduced { qty: filled, closed })
    }

    /// Write the ledger's durable view
    ///
    /// Failures are logged; the next transition or reconcile retries.
    pub async fn persist(&self) {
        let snapshot = self.ledger().snapshot();
        if let Err(e) = self.store.save(&snapshot).await {
            tracing::warn!("Failed to persist DCA snapshot: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{MemoryMarket, PaperAccount};
    use crate::market::SeriesCache;
    use crate::models::{Candle, Resolution};
    use crate::persistence::MemorySnapshotStore;
    use chrono::TimeZone;

    struct Harness {
        coordinator: ExecutionCoordinator,
        account: Arc<PaperAccount>,
        market: Arc<MemoryMarket>,
        cache: SeriesCache,
        catalog: SymbolCatalog,
        ledger: Arc<Mutex<PositionLedger>>,
        cooldowns: Arc<Mutex<CooldownMap>>,
        store: Arc<MemorySnapshotStore>,
    }

    fn sol(qty_precision: u32) -> SymbolInfo {
        SymbolInfo {
            symbol: "SOL_USDT".to_string(),
            qty_precision,
            price_precision: 2,
            min_qty: 0.001,
        }
    }

    fn set_price(cache: &SeriesCache, minute: u32, price: f64) {
        cache
            .upsert(
                "SOL_USDT",
                Resolution::M1,
                Candle {
                    open_time: Utc.with_ymd_and_hms(2024, 1, 1, 0, minute, 0).unwrap(),
                    open: price,
                    high: price,
                    low: price,
                    close: price,
                    volume: 1.0,
                },
            )
            .unwrap();
    }

    fn harness(settings: ExecutionSettings) -> Harness {
        let catalog = SymbolCatalog::new();
        catalog.replace(vec![sol(3)]);
        let cache = SeriesCache::new(100);
        set_price(&cache, 0, 50.0);

        let account = Arc::new(PaperAccount::new(1000.0, cache.clone(), catalog.clone()));
        let market = Arc::new(MemoryMarket::new(vec![sol(3)]));
        let ledger = Arc::new(Mutex::new(PositionLedger::new(3)));
        let cooldowns = Arc::new(Mutex::new(CooldownMap::new()));
        let store = Arc::new(MemorySnapshotStore::new());

        let coordinator = ExecutionCoordinator::new(
            account.clone(),
            market.clone(),
            catalog.clone(),
            ledger.clone(),
            cooldowns.clone(),
            store.clone(),
            settings,
            StrategyParams::default(),
        );

        Harness {
            coordinator,
            account,
            market,
            cache,
            catalog,
            ledger,
            cooldowns,
            store,
        }
    }

    fn metrics(price: f64) -> MetricsSnapshot {
        MetricsSnapshot {
            symbol: "SOL_USDT".to_string(),
            timestamp: Utc::now(),
            rsi_1m: 50.0,
            rsi_3m: 50.0,
            atr_1m: 0.5,
            atr_15m: 2.0,
            bb_lower: price - 5.0,
            bb_upper: price + 5.0,
            price,
            bar_move: 0.0,
            ha_flip: None,
        }
    }

    #[tokio::test]
    async fn test_entry_sizing_end_to_end() {
        let h = harness(ExecutionSettings::default());

        // equity 1000 * 5% = 50 notional at 50.0 -> 1.000
        let outcome = h
            .coordinator
            .enter(&metrics(50.0), Side::Long, Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome, ExecutionOutcome::Entered { qty: 1.0, price: 50.0 });

        let ledger = h.ledger.lock().unwrap();
        let position = ledger.position("SOL_USDT").unwrap();
        assert_eq!(position.quantity, 1.0);
        assert_eq!(position.dca_count, 0);
        assert_eq!(h.store.records()["SOL_USDT"].side, Side::Long);
    }

    #[tokio::test]
    async fn test_strong_signal_doubles_entry() {
        let h = harness(ExecutionSettings::default());
        let m = MetricsSnapshot {
            rsi_1m: 10.0,
            ..metrics(50.0)
        };

        // equity 1000 * 10% = 100 notional at 50.0 -> 2.000
        let outcome = h.coordinator.enter(&m, Side::Long, Utc::now()).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Entered { qty: 2.0, price: 50.0 });
        assert_eq!(h.ledger.lock().unwrap().position("SOL_USDT").unwrap().quantity, 2.0);
    }

    #[tokio::test]
    async fn test_stale_constraints_refresh_and_cool_down() {
        let h = harness(ExecutionSettings::default());
        h.market.set_universe(vec![sol(2)]);
        h.account
            .inject_order_failure(BrokerError::StaleConstraints("ORDER_SIZE_TOO_SMALL".into()));
        let now = Utc::now();

        let err = h
            .coordinator
            .enter(&metrics(50.0), Side::Long, now)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Broker(BrokerError::StaleConstraints(_))));

        // Constraints refetched, slot released, symbol paused
        assert_eq!(h.catalog.get("SOL_USDT").unwrap().qty_precision, 2);
        assert_eq!(h.ledger.lock().unwrap().open_count(), 0);
        assert!(h.cooldowns.lock().unwrap().is_active("SOL_USDT", now));

        let err = h
            .coordinator
            .enter(&metrics(50.0), Side::Long, now + Duration::seconds(10))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::CoolingDown { .. }));
        assert!(err.is_benign());

        // After the cooldown the order goes through
        h.coordinator
            .enter(&metrics(50.0), Side::Long, now + Duration::seconds(301))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_insufficient_balance_has_no_cooldown() {
        let h = harness(ExecutionSettings::default());
        h.account
            .inject_order_failure(BrokerError::InsufficientBalance("BALANCE_NOT_ENOUGH".into()));
        let now = Utc::now();

        assert!(h
            .coordinator
            .enter(&metrics(50.0), Side::Long, now)
            .await
            .is_err());
        assert!(!h.cooldowns.lock().unwrap().is_active("SOL_USDT", now));
        assert_eq!(h.ledger.lock().unwrap().open_count(), 0);
    }

    #[tokio::test]
    async fn test_symbol_limit_blocks_entry() {
        let settings = ExecutionSettings {
            symbol_limit: 1,
            ..Default::default()
        };
        let h = harness(settings);
        h.ledger
            .lock()
            .unwrap()
            .try_reserve("ETH_USDT", Side::Short, 1, Utc::now())
            .unwrap();

        let err = h
            .coordinator
            .enter(&metrics(50.0), Side::Long, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::SymbolLimit(1)));
        assert!(h.account.fetch_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scale_in_grows_position() {
        let h = harness(ExecutionSettings::default());
        h.coordinator
            .enter(&metrics(50.0), Side::Long, Utc::now())
            .await
            .unwrap();

        set_price(&h.cache, 1, 45.0);
        let outcome = h
            .coordinator
            .scale_in(&metrics(45.0), Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome, ExecutionOutcome::ScaledIn { qty: 1.5, price: 45.0 });

        let ledger = h.ledger.lock().unwrap();
        let position = ledger.position("SOL_USDT").unwrap();
        // (1.0 * 50 + 1.5 * 45) / 2.5
        assert!((position.avg_entry_price - 47.0).abs() < 1e-9);
        assert_eq!(position.dca_count, 1);
        assert_eq!(h.store.records()["SOL_USDT"].dca_count, 1);
    }

    #[tokio::test]
    async fn test_take_profit_is_replaced_not_stacked() {
        let h = harness(ExecutionSettings::default());
        h.coordinator
            .enter(&metrics(50.0), Side::Long, Utc::now())
            .await
            .unwrap();

        // max(2.0 * 2.5, 50 * 0.01) = 5.0 above entry
        let outcome = h
            .coordinator
            .refresh_take_profit(&metrics(50.0), Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome, ExecutionOutcome::TakeProfitPlaced { price: 55.0 });

        h.coordinator
            .refresh_take_profit(&metrics(50.0), Utc::now())
            .await
            .unwrap();
        assert_eq!(h.account.open_orders("SOL_USDT"), 1);

        let ledger = h.ledger.lock().unwrap();
        assert!(ledger.position("SOL_USDT").unwrap().last_tp_update.is_some());
    }

    #[tokio::test]
    async fn test_partial_exit_reduces_position() {
        let h = harness(ExecutionSettings::default());
        h.coordinator
            .enter(&metrics(50.0), Side::Long, Utc::now())
            .await
            .unwrap();

        set_price(&h.cache, 1, 53.0);
        let outcome = h
            .coordinator
            .partial_exit(&metrics(53.0), 0.5, Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome, ExecutionOutcome::Reduced { qty: 0.5, closed: false });

        let positions = h.account.fetch_positions().await.unwrap();
        assert_eq!(positions[0].size, 0.5);
        assert_eq!(h.ledger.lock().unwrap().position("SOL_USDT").unwrap().quantity, 0.5);
    }

    #[tokio::test]
    async fn test_actions_need_confirmed_position() {
        let h = harness(ExecutionSettings::default());
        let err = h
            .coordinator
            .apply(&metrics(50.0), &Action::ScaleIn, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::NoPosition(_)));

        let outcome = h
            .coordinator
            .apply(&metrics(50.0), &Action::NoOp, Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome, ExecutionOutcome::Skipped);
    }
}
