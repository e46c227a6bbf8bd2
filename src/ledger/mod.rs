pub mod adapters;
pub mod api;
pub mod catalog;
pub mod models;
pub mod reconciliation;
pub mod scheduler;
pub mod service;
pub mod watcher;

pub use adapters::{EntitlementProviderAdapter, RevenueCatLikeAdapter};
pub use catalog::{plan_config, resolve_plan, Plan, PlanConfig};
pub use models::{CreditLedger, DebitOutcome, EntitlementSnapshot, LedgerEventKind, LedgerSnapshot};
pub use reconciliation::{start_reconciliation_worker, ReconciliationHandle, ReconciliationJob};
pub use scheduler::{process_tick as run_refill_tick, spawn as spawn_refill_scheduler};
pub use service::LedgerService;
pub use watcher::{spawn_change_listener, LedgerHub, LedgerWatch, ListenerError};
