use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;

use super::models::EntitlementSnapshot;

/// key: entitlement-adapter -> provider payload boundary
///
/// Everything provider-specific (payload shapes, REST endpoints, the
/// "boolean-ish" active flags) is normalized here; the ledger core only
/// ever sees an `EntitlementSnapshot`.
#[async_trait]
pub trait EntitlementProviderAdapter: Send + Sync {
    fn normalize_customer_info(&self, payload: &Value) -> Result<EntitlementSnapshot>;
    async fn fetch_customer_info(&self, user_id: &str) -> Result<EntitlementSnapshot>;
}

/// Adapter for a RevenueCat-shaped provider: customer info payloads
/// carry an `entitlements.active` map, webhook events a flat
/// `entitlements` map.
pub struct RevenueCatLikeAdapter {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl RevenueCatLikeAdapter {
    pub fn new(base_url: String, api_key: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }
}

#[async_trait]
impl EntitlementProviderAdapter for RevenueCatLikeAdapter {
    fn normalize_customer_info(&self, payload: &Value) -> Result<EntitlementSnapshot> {
        let mut snapshot = EntitlementSnapshot::default();

        let entitlements = payload
            .get("subscriber")
            .unwrap_or(payload)
            .get("entitlements")
            .ok_or_else(|| anyhow!("payload has no entitlements object"))?;

        // Customer-info form nests the active set; webhook form is flat.
        let map = entitlements
            .get("active")
            .and_then(Value::as_object)
            .or_else(|| entitlements.as_object())
            .ok_or_else(|| anyhow!("entitlements is not an object"))?;

        for (id, value) in map {
            snapshot.active.insert(id.clone(), is_active(value));
        }

        snapshot.platform = payload
            .get("platform")
            .or_else(|| payload.get("store"))
            .and_then(Value::as_str)
            .map(str::to_ascii_lowercase);
        snapshot.rc_customer_id = payload
            .get("original_app_user_id")
            .or_else(|| payload.get("rc_customer_id"))
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(snapshot)
    }

    async fn fetch_customer_info(&self, user_id: &str) -> Result<EntitlementSnapshot> {
        let url = format!("{}/subscribers/{}", self.base_url, user_id);
        let payload: Value = self
            .http
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        self.normalize_customer_info(&payload)
    }
}

/// Providers report the flag as a bool, an expiry-bearing object, or by
/// bare presence in the active map.
fn is_active(value: &Value) -> bool {
    match value {
        Value::Bool(flag) => *flag,
        Value::Null => false,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn adapter() -> RevenueCatLikeAdapter {
        RevenueCatLikeAdapter::new("https://provider.invalid/v1".into(), "test-key".into())
    }

    #[test]
    fn normalizes_customer_info_active_map() {
        let payload = json!({
            "original_app_user_id": "rc_abc123",
            "platform": "iOS",
            "entitlements": {
                "active": {
                    "pro": { "expires_date": "2026-09-25T00:00:00Z" }
                }
            }
        });
        let snapshot = adapter().normalize_customer_info(&payload).unwrap();
        assert_eq!(snapshot.active.get("pro"), Some(&true));
        assert_eq!(snapshot.platform.as_deref(), Some("ios"));
        assert_eq!(snapshot.rc_customer_id.as_deref(), Some("rc_abc123"));
    }

    #[test]
    fn normalizes_flat_webhook_entitlements() {
        let payload = json!({
            "entitlements": { "starter": true, "pro": false }
        });
        let snapshot = adapter().normalize_customer_info(&payload).unwrap();
        assert_eq!(snapshot.active.get("starter"), Some(&true));
        assert_eq!(snapshot.active.get("pro"), Some(&false));
        assert_eq!(snapshot.active_ids().collect::<Vec<_>>(), vec!["starter"]);
    }

    #[test]
    fn rejects_payload_without_entitlements() {
        let payload = json!({ "event": "TEST" });
        assert!(adapter().normalize_customer_info(&payload).is_err());
    }

    #[tokio::test]
    async fn fetches_and_normalizes_subscriber() {
        let server = httpmock::MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::GET)
                    .path("/v1/subscribers/user-1")
                    .header("authorization", "Bearer test-key");
                then.status(200).json_body(json!({
                    "subscriber": {
                        "entitlements": { "active": { "pro_yearly": {} } }
                    }
                }));
            })
            .await;

        let adapter = RevenueCatLikeAdapter::new(format!("{}/v1", server.base_url()), "test-key".into());
        let snapshot = adapter.fetch_customer_info("user-1").await.unwrap();
        mock.assert_async().await;
        assert_eq!(snapshot.active.get("pro_yearly"), Some(&true));
    }
}
