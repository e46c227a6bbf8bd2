use once_cell::sync::Lazy;

/// Secret used to verify identity-provider JWTs. Must be set via the
/// `JWT_SECRET` env variable.
pub static JWT_SECRET: Lazy<String> =
    Lazy::new(|| std::env::var("JWT_SECRET").expect("JWT_SECRET must be set"));

/// Shared secret for HMAC verification of entitlement-provider webhooks.
pub static ENTITLEMENT_WEBHOOK_SECRET: Lazy<String> = Lazy::new(|| {
    std::env::var("ENTITLEMENT_WEBHOOK_SECRET").expect("ENTITLEMENT_WEBHOOK_SECRET must be set")
});

/// Base URL of the entitlement provider's REST API.
pub static ENTITLEMENT_API_URL: Lazy<String> = Lazy::new(|| {
    std::env::var("ENTITLEMENT_API_URL")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "https://api.revenuecat.com/v1".to_string())
});

/// API key presented to the entitlement provider on resync fetches.
pub static ENTITLEMENT_API_KEY: Lazy<String> = Lazy::new(|| {
    std::env::var("ENTITLEMENT_API_KEY").expect("ENTITLEMENT_API_KEY must be set")
});

/// Address the HTTP server should bind to. Defaults to `0.0.0.0`.
pub static BIND_ADDRESS: Lazy<String> =
    Lazy::new(|| std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_string()));

/// Port the HTTP server should listen on. Defaults to `3000`.
pub static BIND_PORT: Lazy<u16> = Lazy::new(|| {
    std::env::var("BIND_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(3000)
});

/// When set to a truthy value, allows the application to continue running
/// even if database migrations fail. Defaults to `false`.
pub static ALLOW_MIGRATION_FAILURE: Lazy<bool> = Lazy::new(|| {
    std::env::var("ALLOW_MIGRATION_FAILURE")
        .ok()
        .map(|value| {
            let normalized = value.trim().to_ascii_lowercase();
            matches!(normalized.as_str(), "1" | "true" | "yes")
        })
        .unwrap_or(false)
});

/// key: refill-config -> background sweep cadence
pub static REFILL_SCAN_INTERVAL_SECS: Lazy<u64> = Lazy::new(|| {
    std::env::var("REFILL_SCAN_INTERVAL_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(3600)
});
