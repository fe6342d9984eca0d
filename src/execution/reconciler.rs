use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::PositionLedger;
use crate::api::{AccountClient, BrokerError, MarketDataSource};
use crate::market::SymbolCatalog;
use crate::models::{DcaRecord, Position, PositionState};
use crate::persistence::SnapshotStore;

/// How long an unfilled entry reservation survives without broker confirmation
const PENDING_GRACE_SECS: i64 = 30;

/// Summary of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    pub held: usize,
    pub adopted: Vec<String>, // Reported by the broker, unknown locally
    pub removed: Vec<String>, // Known locally, gone at the broker
}

/// Resyncs the ledger with broker-reported positions
///
/// Broker truth wins: local entries the broker does not report are dropped
/// and the durable snapshot is rewritten to match. DCA counters and the
/// take-profit stamp carry over from local state when the side matches, and
/// from the startup snapshot otherwise.
pub struct Reconciler {
    account: Arc<dyn AccountClient>,
    market: Arc<dyn MarketDataSource>,
    catalog: SymbolCatalog,
    ledger: Arc<Mutex<PositionLedger>>,
    store: Arc<dyn SnapshotStore>,
    restored: Mutex<HashMap<String, DcaRecord>>,
}

impl Reconciler {
    pub fn new(
        account: Arc<dyn AccountClient>,
        market: Arc<dyn MarketDataSource>,
        catalog: SymbolCatalog,
        ledger: Arc<Mutex<PositionLedger>>,
        store: Arc<dyn SnapshotStore>,
    ) -> Self {
        Self {
            account,
            market,
            catalog,
            ledger,
            store,
            restored: Mutex::new(HashMap::new()),
        }
    }

    /// Load DCA counters persisted by a previous run
    pub async fn restore(&self) -> crate::Result<usize> {
        let records = self.store.load().await?;
        let count = records.len();
        *self.restored.lock().unwrap_or_else(|p| p.into_inner()) = records;
        tracing::info!("Restored {} DCA records from snapshot", count);
        Ok(count)
    }

    /// Rebuild the ledger from the broker's position list
    ///
    /// Entries the coordinator changed while the list was being fetched are
    /// newer than the list and are kept as they are.
    pub async fn reconcile(&self, now: DateTime<Utc>) -> Result<ReconcileReport, BrokerError> {
        let started = self
            .ledger
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .generation();
        let broker = self.account.fetch_positions().await?;

        let (report, snapshot) = {
            let mut ledger = self.ledger.lock().unwrap_or_else(|p| p.into_inner());
            let mut restored = self.restored.lock().unwrap_or_else(|p| p.into_inner());
            let max_dca = ledger.max_dca();
            let previous = ledger.entries().clone();

            let mut next: HashMap<String, PositionState> = HashMap::new();
            let mut report = ReconcileReport::default();

            for bp in broker.iter().filter(|p| p.size > 0.0) {
                if ledger.changed_since(&bp.symbol, started) {
                    continue;
                }
                let (dca_count, last_tp_update) = match previous.get(&bp.symbol) {
                    Some(PositionState::Confirmed(local)) if local.side == bp.side => {
                        (local.dca_count, local.last_tp_update)
                    }
                    _ => {
                        if !matches!(previous.get(&bp.symbol), Some(PositionState::Pending { .. })) {
                            report.adopted.push(bp.symbol.clone());
                        }
                        let dca = restored
                            .get(&bp.symbol)
                            .filter(|r| r.side == bp.side)
                            .map(|r| r.dca_count)
                            .unwrap_or(0);
                        (dca, None)
                    }
                };

                next.insert(
                    bp.symbol.clone(),
                    PositionState::Confirmed(Position {
                        symbol: bp.symbol.clone(),
                        side: bp.side,
                        quantity: bp.size,
                        avg_entry_price: bp.entry_price,
                        dca_count: dca_count.min(max_dca),
                        last_tp_update,
                    }),
                );
            }

            for (symbol, state) in &previous {
                if next.contains_key(symbol) {
                    continue;
                }
                match state {
                    _ if ledger.changed_since(symbol, started) => {
                        next.insert(symbol.clone(), state.clone());
                    }
                    PositionState::Pending { since, .. }
                        if now - *since < Duration::seconds(PENDING_GRACE_SECS) =>
                    {
                        next.insert(symbol.clone(), state.clone());
                    }
                    _ => report.removed.push(symbol.clone()),
                }
            }

            // Startup records for symbols the broker no longer holds
            for symbol in restored.keys() {
                if !next.contains_key(symbol) && !report.removed.contains(symbol) {
                    report.removed.push(symbol.clone());
                }
            }
            restored.retain(|symbol, _| next.contains_key(symbol));

            report.held = next.len();
            report.adopted.sort();
            report.removed.sort();

            ledger.replace_all(next, started);
            (report, ledger.snapshot())
        };

        for symbol in &report.removed {
            tracing::info!(symbol = %symbol, "🧹 Position gone at broker, dropping local state");
        }
        for symbol in &report.adopted {
            tracing::info!(symbol = %symbol, "📥 Adopted broker position");
        }

        if let Err(e) = self.store.save(&snapshot).await {
            tracing::warn!("Failed to persist DCA snapshot: {}", e);
        }

        self.refresh_missing_constraints().await;

        Ok(report)
    }

    /// Every held symbol must have catalog constraints
    async fn refresh_missing_constraints(&self) {
        let held = self
            .ledger
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .held_symbols();

        for symbol in held.iter().filter(|s| !self.catalog.contains(s)) {
            if let Err(e) = self
                .catalog
                .refresh_symbol(self.market.as_ref(), symbol)
                .await
            {
                tracing::warn!(symbol = %symbol, "Could not load constraints for held symbol: {}", e);
            }
        }
    }
}
