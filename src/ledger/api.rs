use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::Extension,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use chrono::Utc;
use futures_util::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use sqlx::PgPool;
use tokio_stream::wrappers::BroadcastStream;
use tracing::error;

use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;

use super::adapters::EntitlementProviderAdapter;
use super::models::{DebitOutcome, LedgerSnapshot};
use super::service::LedgerService;
use super::watcher::LedgerHub;

/// key: ledger-api -> rest endpoints
///
/// Reads prefer the hub cache (kept fresh by the change feed); the
/// authoritative value is always the store.
pub async fn get_ledger(
    Extension(pool): Extension<PgPool>,
    Extension(hub): Extension<LedgerHub>,
    AuthUser { user_id }: AuthUser,
) -> AppResult<Json<LedgerSnapshot>> {
    if let Some(cached) = hub.cached(&user_id) {
        return Ok(Json(cached));
    }
    let service = LedgerService::new(pool);
    let ledger = service.fetch(&user_id).await?.ok_or(AppError::NoLedger)?;
    Ok(Json(LedgerSnapshot::from(&ledger)))
}

#[derive(Debug, Deserialize)]
pub struct DebitRequest {
    pub cost: i64,
}

pub async fn debit(
    Extension(pool): Extension<PgPool>,
    Extension(hub): Extension<LedgerHub>,
    AuthUser { user_id }: AuthUser,
    Json(payload): Json<DebitRequest>,
) -> AppResult<Json<DebitOutcome>> {
    let service = LedgerService::new(pool);
    let outcome = service.debit(&user_id, payload.cost).await?;
    // Optimistic local update; the change feed delivers the same snapshot
    // to every other process.
    hub.publish(LedgerSnapshot::from(&outcome.ledger));
    Ok(Json(outcome))
}

/// App-launch hook: replenish the caller's subscription credits if a
/// refill is due, then return the current ledger either way.
pub async fn refill(
    Extension(pool): Extension<PgPool>,
    Extension(hub): Extension<LedgerHub>,
    AuthUser { user_id }: AuthUser,
) -> AppResult<Json<LedgerSnapshot>> {
    let service = LedgerService::new(pool);
    let ledger = service.fetch(&user_id).await?.ok_or(AppError::NoLedger)?;
    let refreshed = service
        .maybe_refill(&user_id, ledger.plan_kind(), Utc::now())
        .await?;
    let latest = refreshed.unwrap_or(ledger);
    let snapshot = LedgerSnapshot::from(&latest);
    hub.publish(snapshot.clone());
    Ok(Json(snapshot))
}

/// Pull the authoritative entitlement state from the provider and
/// reconcile it, for clients that suspect a missed webhook.
pub async fn resync(
    Extension(pool): Extension<PgPool>,
    Extension(hub): Extension<LedgerHub>,
    Extension(adapter): Extension<Arc<dyn EntitlementProviderAdapter>>,
    AuthUser { user_id }: AuthUser,
) -> AppResult<Json<LedgerSnapshot>> {
    let snapshot = adapter.fetch_customer_info(&user_id).await.map_err(|err| {
        error!(?err, %user_id, "entitlement provider fetch failed");
        AppError::Message("entitlement provider fetch failed".into())
    })?;
    let service = LedgerService::new(pool);
    let ledger = service.reconcile(&user_id, &snapshot, Utc::now()).await?;
    let snapshot = LedgerSnapshot::from(&ledger);
    hub.publish(snapshot.clone());
    Ok(Json(snapshot))
}

/// Live snapshot feed for the caller's ledger: the current state first,
/// then every subsequent committed change.
pub async fn stream_ledger(
    Extension(pool): Extension<PgPool>,
    Extension(hub): Extension<LedgerHub>,
    AuthUser { user_id }: AuthUser,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let watch = hub.watch(&user_id);

    let initial = match hub.cached(&user_id) {
        Some(snapshot) => Some(snapshot),
        None => {
            let service = LedgerService::new(pool);
            service.fetch(&user_id).await?.map(|l| LedgerSnapshot::from(&l))
        }
    };
    let initial = stream::iter(initial.and_then(snapshot_event));

    let live = BroadcastStream::new(watch.into_receiver()).filter_map(|res| async move {
        match res {
            Ok(snapshot) => snapshot_event(snapshot),
            // Lagged consumers skip to the freshest snapshots.
            Err(_) => None,
        }
    });

    Ok(Sse::new(initial.chain(live)).keep_alive(KeepAlive::default()))
}

fn snapshot_event(snapshot: LedgerSnapshot) -> Option<Result<Event, Infallible>> {
    match serde_json::to_string(&snapshot) {
        Ok(data) => Some(Ok(Event::default().data(data))),
        Err(err) => {
            error!(?err, "ledger snapshot serialization failed");
            None
        }
    }
}
