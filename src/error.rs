use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("entitlement provider error: {0}")]
    Provider(#[from] reqwest::Error),
    #[error("not authenticated")]
    NotAuthenticated,
    #[error("no ledger exists for this user")]
    NoLedger,
    #[error("insufficient credits: {available} available, {requested} requested")]
    InsufficientCredits { available: i64, requested: i64 },
    #[error("transaction conflict, retries exhausted")]
    Conflict,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("{0}")]
    Message(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        // Insufficient credits is a business condition the client branches
        // on (upsell), distinct from sign-in and transient failures.
        let status = match self {
            AppError::NotAuthenticated => StatusCode::UNAUTHORIZED,
            AppError::NoLedger => StatusCode::NOT_FOUND,
            AppError::InsufficientCredits { .. } => StatusCode::PAYMENT_REQUIRED,
            AppError::Conflict => StatusCode::CONFLICT,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Provider(_) => StatusCode::BAD_GATEWAY,
            AppError::Db(_) | AppError::Message(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        tracing::error!(?self);
        let body = Json(json!({
            "error": error_code(&self),
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}

fn error_code(err: &AppError) -> &'static str {
    match err {
        AppError::Db(_) => "store_error",
        AppError::Provider(_) => "provider_error",
        AppError::NotAuthenticated => "not_authenticated",
        AppError::NoLedger => "no_ledger",
        AppError::InsufficientCredits { .. } => "insufficient_credits",
        AppError::Conflict => "conflict",
        AppError::BadRequest(_) => "bad_request",
        AppError::Message(_) => "internal",
    }
}

pub type AppResult<T> = Result<T, AppError>;
