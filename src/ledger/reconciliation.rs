use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde_json::Value;
use sqlx::PgPool;
use tokio::sync::mpsc::{channel, Sender};
use tracing::{error, info};

use super::adapters::EntitlementProviderAdapter;
use super::models::LedgerSnapshot;
use super::service::LedgerService;
use super::watcher::LedgerHub;

/// key: entitlement-reconciliation -> explicit provider-event handler
///
/// Provider callbacks are modeled as explicit messages rather than side
/// effects buried in a listener registration: the webhook (or a manual
/// resync) dispatches a job, one worker translates it into `reconcile`.
#[derive(Debug)]
pub enum ReconciliationJob {
    EntitlementChanged { user_id: String, payload: Value },
}

#[derive(Clone)]
pub struct ReconciliationHandle {
    sender: Sender<ReconciliationJob>,
}

impl ReconciliationHandle {
    pub async fn dispatch(&self, job: ReconciliationJob) -> Result<()> {
        self.sender
            .send(job)
            .await
            .map_err(|err| anyhow!("failed to enqueue entitlement reconciliation job: {err}"))
    }
}

pub fn start_reconciliation_worker(
    pool: PgPool,
    hub: LedgerHub,
    adapter: Arc<dyn EntitlementProviderAdapter>,
) -> ReconciliationHandle {
    let (tx, mut rx) = channel(64);
    tokio::spawn(async move {
        let service = LedgerService::new(pool);
        while let Some(job) = rx.recv().await {
            match job {
                ReconciliationJob::EntitlementChanged { user_id, payload } => {
                    let snapshot = match adapter.normalize_customer_info(&payload) {
                        Ok(snapshot) => snapshot,
                        Err(err) => {
                            error!(
                                ?err,
                                %user_id,
                                "failed to normalize entitlement payload from provider"
                            );
                            continue;
                        }
                    };
                    match service
                        .reconcile(&user_id, &snapshot, chrono::Utc::now())
                        .await
                    {
                        Ok(ledger) => {
                            info!(
                                %user_id,
                                plan = %ledger.plan,
                                "entitlement state reconciled into ledger"
                            );
                            hub.publish(LedgerSnapshot::from(&ledger));
                        }
                        Err(err) => {
                            error!(
                                ?err,
                                %user_id,
                                "failed to reconcile entitlement update from provider"
                            );
                        }
                    }
                }
            }
        }
    });

    ReconciliationHandle { sender: tx }
}
