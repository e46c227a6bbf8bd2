use axum::{extract::Extension, http::StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error};

use crate::error::{AppError, AppResult};
use crate::ledger::{ReconciliationHandle, ReconciliationJob};

/// key: webhooks-entitlements -> provider callback entrypoint
#[derive(Debug, Deserialize)]
pub struct EntitlementWebhookRequest {
    pub event: String,
    pub app_user_id: String,
    #[serde(default)]
    pub customer_info: Value,
}

/// Handle entitlement-provider webhooks using the shared secret for HMAC
/// verification of the raw body.
pub async fn entitlement_webhook(
    Extension(reconciliation): Extension<ReconciliationHandle>,
    headers: axum::http::HeaderMap,
    body: axum::body::Bytes,
) -> AppResult<StatusCode> {
    let sig_header = headers
        .get("x-signature")
        .or_else(|| headers.get("x-webhook-signature"))
        .ok_or(AppError::BadRequest("Missing signature".into()))?;
    let sig = sig_header
        .to_str()
        .map_err(|_| AppError::BadRequest("Bad signature".into()))?;
    let secret = crate::config::ENTITLEMENT_WEBHOOK_SECRET.as_str();
    if !verify_signature(secret, &body, sig) {
        return Err(AppError::NotAuthenticated);
    }

    let payload: EntitlementWebhookRequest = serde_json::from_slice(&body)
        .map_err(|err| AppError::BadRequest(format!("invalid webhook body: {err}")))?;

    match payload.event.as_str() {
        "entitlements.updated" | "customer_info.updated" | "subscription.changed" => {
            reconciliation
                .dispatch(ReconciliationJob::EntitlementChanged {
                    user_id: payload.app_user_id,
                    payload: payload.customer_info,
                })
                .await
                .map_err(|err| {
                    error!(?err, "failed to dispatch entitlement reconciliation");
                    AppError::Message("reconciliation queue unavailable".into())
                })?;
            Ok(StatusCode::ACCEPTED)
        }
        other => {
            debug!(event = other, "ignoring unhandled entitlement webhook event");
            Ok(StatusCode::ACCEPTED)
        }
    }
}

fn verify_signature(secret: &str, body: &[u8], provided: &str) -> bool {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    let expected = {
        let mut mac =
            Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC can use any key length");
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    };
    expected == provided
}

#[cfg(test)]
mod tests {
    use super::*;
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn accepts_valid_signature() {
        let body = br#"{"event":"entitlements.updated"}"#;
        let sig = sign("topsecret", body);
        assert!(verify_signature("topsecret", body, &sig));
    }

    #[test]
    fn rejects_wrong_secret_or_tampered_body() {
        let body = br#"{"event":"entitlements.updated"}"#;
        let sig = sign("topsecret", body);
        assert!(!verify_signature("othersecret", body, &sig));
        assert!(!verify_signature("topsecret", b"tampered", &sig));
        assert!(!verify_signature("topsecret", body, "sha256=deadbeef"));
    }
}
