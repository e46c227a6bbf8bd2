use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::catalog::Plan;

/// key: ledger-model -> per-user credit record
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CreditLedger {
    pub user_id: String,
    pub plan: String,
    pub subscription_credits: i64,
    pub extra_credits: i64,
    pub max_subscription_credits: i64,
    pub last_refill_at: Option<DateTime<Utc>>,
    pub next_refill_at: Option<DateTime<Utc>>,
    pub entitlements: serde_json::Value,
    pub platform: Option<String>,
    pub rc_customer_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CreditLedger {
    pub fn plan_kind(&self) -> Plan {
        Plan::from_str_lenient(&self.plan)
    }

    pub fn total_credits(&self) -> i64 {
        self.subscription_credits + self.extra_credits
    }
}

/// What observers receive. Timestamps are already canonical UTC here;
/// conversion from provider-native representations happens at the
/// store/listener boundary, never in consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub user_id: String,
    pub plan: String,
    pub subscription_credits: i64,
    pub extra_credits: i64,
    pub max_subscription_credits: i64,
    pub last_refill_at: Option<DateTime<Utc>>,
    pub next_refill_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl LedgerSnapshot {
    pub fn total_credits(&self) -> i64 {
        self.subscription_credits + self.extra_credits
    }
}

impl From<&CreditLedger> for LedgerSnapshot {
    fn from(ledger: &CreditLedger) -> Self {
        LedgerSnapshot {
            user_id: ledger.user_id.clone(),
            plan: ledger.plan.clone(),
            subscription_credits: ledger.subscription_credits,
            extra_credits: ledger.extra_credits,
            max_subscription_credits: ledger.max_subscription_credits,
            last_refill_at: ledger.last_refill_at,
            next_refill_at: ledger.next_refill_at,
            updated_at: ledger.updated_at,
        }
    }
}

/// key: ledger-debit-outcome -> pool split applied by a committed debit
#[derive(Debug, Clone, Serialize)]
pub struct DebitOutcome {
    pub cost: i64,
    pub subscription_spent: i64,
    pub extra_spent: i64,
    pub ledger: CreditLedger,
}

/// Normalized entitlement state from the external provider. Only the
/// active flags matter for plan resolution; the raw map is persisted
/// verbatim for audit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntitlementSnapshot {
    pub active: BTreeMap<String, bool>,
    pub platform: Option<String>,
    pub rc_customer_id: Option<String>,
}

impl EntitlementSnapshot {
    pub fn active_ids(&self) -> impl Iterator<Item = &str> {
        self.active
            .iter()
            .filter(|(_, active)| **active)
            .map(|(id, _)| id.as_str())
    }
}

/// Audit trail row kinds, one per committed mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerEventKind {
    Create,
    Debit,
    Refill,
    Reconcile,
}

impl LedgerEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerEventKind::Create => "create",
            LedgerEventKind::Debit => "debit",
            LedgerEventKind::Refill => "refill",
            LedgerEventKind::Reconcile => "reconcile",
        }
    }
}
