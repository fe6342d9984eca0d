use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use uuid::Uuid;

use super::{AccountClient, BrokerError, BrokerPosition, Equity, OrderAck};
use crate::market::{SeriesCache, SymbolCatalog};
use crate::models::{Resolution, Side};

const DUST: f64 = 1e-9;

#[derive(Debug, Clone)]
struct PaperPosition {
    side: Side,
    size: f64,
    entry_price: f64,
    leverage: u32,
}

#[derive(Debug, Clone)]
struct RestingOrder {
    id: String,
    side: Side,
    qty: f64,
    price: f64,
}

#[derive(Debug, Default)]
struct PaperState {
    wallet: f64,
    positions: HashMap<String, PaperPosition>,
    orders: HashMap<String, Vec<RestingOrder>>,
    leverage: HashMap<String, u32>,
    injected: VecDeque<BrokerError>,
    offline: bool,
}

/// Simulated futures account
///
/// Market orders fill at the latest cached 1m close. Positions are netted per
/// symbol. Reduce-only limit orders rest until `fetch_positions` sees the
/// price trade through them. Quantities are checked against the symbol
/// catalog the same way the exchange would.
pub struct PaperAccount {
    prices: SeriesCache,
    catalog: SymbolCatalog,
    state: Mutex<PaperState>,
}

impl PaperAccount {
    pub fn new(starting_equity: f64, prices: SeriesCache, catalog: SymbolCatalog) -> Self {
        Self {
            prices,
            catalog,
            state: Mutex::new(PaperState {
                wallet: starting_equity,
                ..Default::default()
            }),
        }
    }

    /// Make the next order placement fail with `error`
    pub fn inject_order_failure(&self, error: BrokerError) {
        self.lock().injected.push_back(error);
    }

    /// Simulate the exchange being unreachable
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Remove a position as if it had been closed outside the bot
    pub fn force_close(&self, symbol: &str) {
        let mut state = self.lock();
        state.positions.remove(symbol);
        state.orders.remove(symbol);
    }

    pub fn open_orders(&self, symbol: &str) -> usize {
        self.lock().orders.get(symbol).map(|o| o.len()).unwrap_or(0)
    }

    pub fn wallet_balance(&self) -> f64 {
        self.lock().wallet
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PaperState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn last_price(&self, symbol: &str) -> Option<f64> {
        self.prices
            .window(symbol, Resolution::M1, 1)
            .ok()?
            .last()
            .map(|c| c.close)
    }

    fn check_online(state: &PaperState) -> Result<(), BrokerError> {
        if state.offline {
            return Err(BrokerError::Transport("paper exchange offline".into()));
        }
        Ok(())
    }

    fn check_constraints(&self, symbol: &str, qty: f64) -> Result<(), BrokerError> {
        let info = self
            .catalog
            .get(symbol)
            .ok_or_else(|| BrokerError::Rejected(format!("unknown contract {}", symbol)))?;

        if !qty.is_finite() || qty <= 0.0 {
            return Err(BrokerError::Rejected(format!("invalid quantity {}", qty)));
        }
        if !info.is_qty_aligned(qty) {
            return Err(BrokerError::StaleConstraints(format!(
                "quantity {} exceeds {} decimals",
                qty, info.qty_precision
            )));
        }
        if qty + DUST < info.min_qty {
            return Err(BrokerError::StaleConstraints(format!(
                "quantity {} below minimum {}",
                qty, info.min_qty
            )));
        }
        Ok(())
    }

    fn unrealized(state: &PaperState, prices: &HashMap<String, f64>) -> (f64, f64) {
        let mut pnl = 0.0;
        let mut margin = 0.0;
        for (symbol, pos) in &state.positions {
            let price = prices.get(symbol).copied().unwrap_or(pos.entry_price);
            pnl += (price - pos.entry_price) * pos.size * pos.side.sign();
            margin += pos.size * pos.entry_price / pos.leverage.max(1) as f64;
        }
        (pnl, margin)
    }

    fn price_map(&self, state: &PaperState) -> HashMap<String, f64> {
        state
            .positions
            .keys()
            .filter_map(|s| self.last_price(s).map(|p| (s.clone(), p)))
            .collect()
    }

    /// Reduce a position by `qty` at `price`, realising P&L
    ///
    /// Returns the quantity actually closed.
    fn reduce(state: &mut PaperState, symbol: &str, qty: f64, price: f64) -> f64 {
        let Some(pos) = state.positions.get_mut(symbol) else {
            return 0.0;
        };

        let closed = qty.min(pos.size);
        let realized = (price - pos.entry_price) * closed * pos.side.sign();
        pos.size -= closed;
        let flat = pos.size <= DUST;

        state.wallet += realized;
        if flat {
            state.positions.remove(symbol);
            state.orders.remove(symbol);
        }
        closed
    }

    /// Fill resting reduce-only orders the last price has traded through
    fn settle_resting(&self, state: &mut PaperState) {
        let symbols: Vec<String> = state.orders.keys().cloned().collect();

        for symbol in symbols {
            let Some(price) = self.last_price(&symbol) else {
                continue;
            };
            let orders = state.orders.remove(&symbol).unwrap_or_default();
            let mut remaining = Vec::new();

            for order in orders {
                let crossed = match order.side {
                    Side::Short => price >= order.price, // sell limit closes a long
                    Side::Long => price <= order.price,  // buy limit closes a short
                };
                let held_opposite = state
                    .positions
                    .get(&symbol)
                    .map(|p| p.side == order.side.opposite())
                    .unwrap_or(false);

                if crossed && held_opposite {
                    let closed = Self::reduce(state, &symbol, order.qty, order.price);
                    tracing::info!(
                        symbol = %symbol,
                        order_id = %order.id,
                        qty = closed,
                        price = order.price,
                        "📄 Paper limit order filled"
                    );
                } else if held_opposite {
                    remaining.push(order);
                }
            }

            if !remaining.is_empty() && state.positions.contains_key(&symbol) {
                state.orders.insert(symbol, remaining);
            }
        }
    }
}

#[async_trait]
impl AccountClient for PaperAccount {
    async fn fetch_equity(&self) -> Result<Equity, BrokerError> {
        let state = self.lock();
        Self::check_online(&state)?;

        let prices = self.price_map(&state);
        let (pnl, margin) = Self::unrealized(&state, &prices);
        let total = state.wallet + pnl;

        Ok(Equity {
            total,
            available: (total - margin).max(0.0),
        })
    }

    async fn fetch_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        let mut state = self.lock();
        Self::check_online(&state)?;

        self.settle_resting(&mut state);

        let mut positions: Vec<BrokerPosition> = state
            .positions
            .iter()
            .map(|(symbol, p)| BrokerPosition {
                symbol: symbol.clone(),
                side: p.side,
                size: p.size,
                entry_price: p.entry_price,
            })
            .collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(positions)
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        reduce_only: bool,
    ) -> Result<OrderAck, BrokerError> {
        let mut state = self.lock();
        Self::check_online(&state)?;
        if let Some(err) = state.injected.pop_front() {
            return Err(err);
        }

        self.check_constraints(symbol, qty)?;
        let price = self
            .last_price(symbol)
            .ok_or_else(|| BrokerError::Rejected(format!("no price for {}", symbol)))?;

        let held = state.positions.get(symbol).cloned();

        if reduce_only {
            let closes = held.as_ref().map(|p| p.side == side.opposite()).unwrap_or(false);
            if !closes {
                return Err(BrokerError::Rejected(
                    "reduce-only order would increase position".into(),
                ));
            }
            let filled = Self::reduce(&mut state, symbol, qty, price);
            return Ok(OrderAck {
                order_id: Uuid::new_v4().to_string(),
                filled_qty: filled,
                avg_price: Some(price),
            });
        }

        let leverage = state.leverage.get(symbol).copied().unwrap_or(1);
        let prices = self.price_map(&state);
        let (pnl, margin) = Self::unrealized(&state, &prices);
        let available = state.wallet + pnl - margin;
        let required = qty * price / leverage as f64;
        if required > available {
            return Err(BrokerError::InsufficientBalance(format!(
                "need {:.2} margin, {:.2} available",
                required, available
            )));
        }

        let mut remaining = qty;
        if let Some(p) = &held {
            if p.side != side {
                remaining -= Self::reduce(&mut state, symbol, qty, price);
            }
        }

        if remaining > DUST {
            let pos = state
                .positions
                .entry(symbol.to_string())
                .or_insert(PaperPosition {
                    side,
                    size: 0.0,
                    entry_price: price,
                    leverage,
                });
            let total = pos.size + remaining;
            pos.entry_price = (pos.size * pos.entry_price + remaining * price) / total;
            pos.size = total;
            pos.leverage = leverage;
        }

        tracing::info!(symbol, side = %side, qty, price, "📄 Paper market order filled");

        Ok(OrderAck {
            order_id: Uuid::new_v4().to_string(),
            filled_qty: qty,
            avg_price: Some(price),
        })
    }

    async fn place_limit_order(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        price: f64,
        reduce_only: bool,
    ) -> Result<OrderAck, BrokerError> {
        let mut state = self.lock();
        Self::check_online(&state)?;
        if let Some(err) = state.injected.pop_front() {
            return Err(err);
        }

        if !reduce_only {
            return Err(BrokerError::Rejected(
                "only reduce-only limit orders are supported".into(),
            ));
        }
        self.check_constraints(symbol, qty)?;
        if !price.is_finite() || price <= 0.0 {
            return Err(BrokerError::Rejected(format!("invalid price {}", price)));
        }

        let closes = state
            .positions
            .get(symbol)
            .map(|p| p.side == side.opposite())
            .unwrap_or(false);
        if !closes {
            return Err(BrokerError::Rejected(
                "reduce-only order would increase position".into(),
            ));
        }

        let id = Uuid::new_v4().to_string();
        state
            .orders
            .entry(symbol.to_string())
            .or_default()
            .push(RestingOrder {
                id: id.clone(),
                side,
                qty,
                price,
            });

        Ok(OrderAck {
            order_id: id,
            filled_qty: 0.0,
            avg_price: None,
        })
    }

    async fn cancel_all_orders(&self, symbol: &str) -> Result<(), BrokerError> {
        let mut state = self.lock();
        Self::check_online(&state)?;
        state.orders.remove(symbol);
        Ok(())
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), BrokerError> {
        let mut state = self.lock();
        Self::check_online(&state)?;
        if leverage == 0 {
            return Err(BrokerError::Rejected("leverage must be positive".into()));
        }
        state.leverage.insert(symbol.to_string(), leverage);
        Ok(())
    }
}
