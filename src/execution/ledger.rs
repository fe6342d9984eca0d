use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::models::{DcaRecord, Position, PositionState, Side};

/// Quantities below this are treated as flat
const QTY_EPSILON: f64 = 1e-9;

/// Authoritative per-symbol position state
///
/// One entry per symbol: `Pending` while an entry order is in flight,
/// `Confirmed` once a fill is known. The ledger owns the average entry price
/// and the DCA counter; nothing else derives them.
pub struct PositionLedger {
    entries: HashMap<String, PositionState>,
    max_dca: u32,
    generation: u64,
    touched: HashMap<String, u64>, // symbol -> generation of its last local change
}

impl PositionLedger {
    pub fn new(max_dca: u32) -> Self {
        Self {
            entries: HashMap::new(),
            max_dca,
            generation: 0,
            touched: HashMap::new(),
        }
    }

    /// Counter bumped by every local transition
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether `symbol` changed locally after `generation` was read
    pub fn changed_since(&self, symbol: &str, generation: u64) -> bool {
        self.touched
            .get(symbol)
            .is_some_and(|touched| *touched > generation)
    }

    fn touch(&mut self, symbol: &str) {
        self.generation += 1;
        self.touched.insert(symbol.to_string(), self.generation);
    }

    pub fn max_dca(&self) -> u32 {
        self.max_dca
    }

    pub fn get(&self, symbol: &str) -> Option<&PositionState> {
        self.entries.get(symbol)
    }

    /// Confirmed position for symbol, if any
    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.entries.get(symbol).and_then(PositionState::confirmed)
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.entries.contains_key(symbol)
    }

    /// Number of occupied slots (pending and confirmed)
    pub fn open_count(&self) -> usize {
        self.entries.len()
    }

    /// Symbols with an occupied slot, sorted
    pub fn held_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.entries.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    pub fn positions(&self) -> Vec<&Position> {
        self.entries.values().filter_map(PositionState::confirmed).collect()
    }

    pub fn entries(&self) -> &HashMap<String, PositionState> {
        &self.entries
    }

    /// Reserve an entry slot for `symbol`
    ///
    /// Fails when the symbol already has an entry or `limit` slots are taken.
    /// The slot check and the insert happen under the same borrow, so two
    /// callers can never both pass the limit.
    pub fn try_reserve(
        &mut self,
        symbol: &str,
        side: Side,
        limit: usize,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        if self.entries.contains_key(symbol) {
            anyhow::bail!("Already have an entry for {}", symbol);
        }
        if self.entries.len() >= limit {
            anyhow::bail!("Symbol limit reached ({}/{})", self.entries.len(), limit);
        }

        self.entries
            .insert(symbol.to_string(), PositionState::Pending { side, since: now });
        self.touch(symbol);
        Ok(())
    }

    /// Drop a pending reservation (entry order failed)
    ///
    /// Confirmed positions are left untouched.
    pub fn release(&mut self, symbol: &str) -> bool {
        if matches!(self.entries.get(symbol), Some(PositionState::Pending { .. })) {
            self.entries.remove(symbol);
            self.touch(symbol);
            return true;
        }
        false
    }

    /// Record the fill of an entry order
    ///
    /// NONE/PENDING -> OPEN(dca=0), average price = fill price.
    pub fn confirm_entry(
        &mut self,
        symbol: &str,
        side: Side,
        quantity: f64,
        fill_price: f64,
    ) -> anyhow::Result<&Position> {
        if quantity <= QTY_EPSILON || fill_price <= 0.0 {
            anyhow::bail!(
                "Invalid entry fill for {}: {} @ {}",
                symbol,
                quantity,
                fill_price
            );
        }

        match self.entries.get(symbol) {
            Some(PositionState::Confirmed(_)) => {
                anyhow::bail!("Already have open position for {}", symbol)
            }
            Some(PositionState::Pending { side: reserved, .. }) if *reserved != side => {
                anyhow::bail!(
                    "Entry fill side {} does not match reservation {} for {}",
                    side,
                    reserved,
                    symbol
                )
            }
            _ => {}
        }

        let position = Position {
            symbol: symbol.to_string(),
            side,
            quantity,
            avg_entry_price: fill_price,
            dca_count: 0,
            last_tp_update: None,
        };

        tracing::info!(
            "Opened {} {} {:.4} @ ${:.4}",
            side,
            symbol,
            quantity,
            fill_price
        );

        self.entries
            .insert(symbol.to_string(), PositionState::Confirmed(position));
        self.touch(symbol);
        self.confirmed_mut(symbol).map(|p| &*p)
    }

    /// Record a scale-in fill
    ///
    /// OPEN(k) -> OPEN(k+1) with a volume-weighted average entry. The take
    /// profit is marked stale because the average moved.
    pub fn scale_in(
        &mut self,
        symbol: &str,
        fill_qty: f64,
        fill_price: f64,
    ) -> anyhow::Result<&Position> {
        if fill_qty <= QTY_EPSILON || fill_price <= 0.0 {
            anyhow::bail!(
                "Invalid scale-in fill for {}: {} @ {}",
                symbol,
                fill_qty,
                fill_price
            );
        }

        let max_dca = self.max_dca;
        let position = self.confirmed_mut(symbol)?;
        if position.dca_count >= max_dca {
            anyhow::bail!(
                "DCA limit reached for {} ({}/{})",
                symbol,
                position.dca_count,
                max_dca
            );
        }

        let total_qty = position.quantity + fill_qty;
        position.avg_entry_price =
            (position.quantity * position.avg_entry_price + fill_qty * fill_price) / total_qty;
        position.quantity = total_qty;
        position.dca_count += 1;
        position.last_tp_update = None;

        tracing::info!(
            "Scaled into {} @ ${:.4} (avg: ${:.4}, total qty: {:.4}, dca: {}/{})",
            symbol,
            fill_price,
            position.avg_entry_price,
            position.quantity,
            position.dca_count,
            max_dca
        );

        self.touch(symbol);
        self.confirmed_mut(symbol).map(|p| &*p)
    }

    /// Reduce a position after a reduce-only fill
    ///
    /// Returns the remaining position, or None when the fill closed it.
    pub fn reduce(&mut self, symbol: &str, qty: f64) -> anyhow::Result<Option<Position>> {
        let position = self.confirmed_mut(symbol)?;

        let remaining = if qty + QTY_EPSILON >= position.quantity {
            None
        } else {
            position.quantity -= qty;
            position.last_tp_update = None;
            Some(position.clone())
        };

        if remaining.is_none() {
            self.entries.remove(symbol);
            tracing::info!("Closed {}", symbol);
        }
        self.touch(symbol);
        Ok(remaining)
    }

    /// Remove a symbol regardless of state
    pub fn close(&mut self, symbol: &str) -> Option<PositionState> {
        let removed = self.entries.remove(symbol);
        if removed.is_some() {
            self.touch(symbol);
        }
        removed
    }

    pub fn mark_tp_updated(&mut self, symbol: &str, at: DateTime<Utc>) -> anyhow::Result<()> {
        self.confirmed_mut(symbol)?.last_tp_update = Some(at);
        Ok(())
    }

    /// Replace every entry with broker-derived state
    ///
    /// Change stamps at or below `synced` are covered by the new state and
    /// are forgotten.
    pub fn replace_all(&mut self, entries: HashMap<String, PositionState>, synced: u64) {
        self.entries = entries;
        self.touched.retain(|_, touched| *touched > synced);
    }

    /// Durable view: side and DCA count of each confirmed position
    pub fn snapshot(&self) -> HashMap<String, DcaRecord> {
        self.entries
            .iter()
            .filter_map(|(symbol, state)| {
                state.confirmed().map(|p| {
                    (
                        symbol.clone(),
                        DcaRecord {
                            side: p.side,
                            dca_count: p.dca_count,
                        },
                    )
                })
            })
            .collect()
    }

    fn confirmed_mut(&mut self, symbol: &str) -> anyhow::Result<&mut Position> {
        match self.entries.get_mut(symbol) {
            Some(PositionState::Confirmed(position)) => Ok(position),
            Some(PositionState::Pending { .. }) => {
                anyhow::bail!("Position for {} is still pending", symbol)
            }
            None => anyhow::bail!("No open position for {}", symbol),
        }
    }
}
