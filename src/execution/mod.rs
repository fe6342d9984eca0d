// Position lifecycle: ledger, order execution, broker reconciliation
pub mod cooldown;
pub mod coordinator;
pub mod ledger;
pub mod reconciler;

pub use cooldown::CooldownMap;
pub use coordinator::{ExecutionCoordinator, ExecutionError, ExecutionOutcome};
pub use ledger::PositionLedger;
pub use reconciler::{ReconcileReport, Reconciler};
