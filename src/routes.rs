use axum::{
    routing::{get, post},
    Router,
};

use crate::ledger::api;
use crate::webhooks;

pub fn api_routes() -> Router {
    Router::new()
        .route("/api/billing/ledger", get(api::get_ledger))
        .route("/api/billing/ledger/stream", get(api::stream_ledger))
        .route("/api/billing/debit", post(api::debit))
        .route("/api/billing/refill", post(api::refill))
        .route("/api/billing/resync", post(api::resync))
        .route(
            "/api/webhooks/entitlements",
            post(webhooks::entitlement_webhook),
        )
}
