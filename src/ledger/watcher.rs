use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::models::LedgerSnapshot;

const CHANNEL: &str = "user_billing_changed";
const FANOUT_CAPACITY: usize = 16;

/// Error surfaced on the watcher's side channel. Subscriptions are never
/// torn down silently: a broken change feed shows up here while the
/// listener task reconnects.
#[derive(Debug, Clone)]
pub struct ListenerError {
    pub message: String,
    pub at: DateTime<Utc>,
}

/// key: ledger-hub -> per-user fan-out + read cache
///
/// The single writer for the process-wide snapshot cache: only the
/// change-feed task and the optimistic post-commit path publish into it.
/// The hub itself never writes to the store.
#[derive(Clone)]
pub struct LedgerHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    channels: DashMap<String, broadcast::Sender<LedgerSnapshot>>,
    cache: DashMap<String, LedgerSnapshot>,
    errors: broadcast::Sender<ListenerError>,
}

impl Default for LedgerHub {
    fn default() -> Self {
        Self::new()
    }
}

impl LedgerHub {
    pub fn new() -> Self {
        let (errors, _) = broadcast::channel(FANOUT_CAPACITY);
        LedgerHub {
            inner: Arc::new(HubInner {
                channels: DashMap::new(),
                cache: DashMap::new(),
                errors,
            }),
        }
    }

    /// Deliver a fresh snapshot to every watcher of this user and refresh
    /// the cache. Called from the change-feed task and, optimistically,
    /// right after a committed mutation in this process.
    pub fn publish(&self, snapshot: LedgerSnapshot) {
        self.inner
            .cache
            .insert(snapshot.user_id.clone(), snapshot.clone());
        if let Some(sender) = self.inner.channels.get(&snapshot.user_id) {
            // No receivers is fine; watchers may come and go.
            let _ = sender.send(snapshot);
        }
    }

    /// Last snapshot seen for this user, if any. May lag the store by a
    /// delivery; the authoritative value is always a point read.
    pub fn cached(&self, user_id: &str) -> Option<LedgerSnapshot> {
        self.inner.cache.get(user_id).map(|entry| entry.clone())
    }

    pub fn watch(&self, user_id: &str) -> LedgerWatch {
        use dashmap::mapref::entry::Entry;
        let rx = match self.inner.channels.entry(user_id.to_string()) {
            Entry::Occupied(e) => e.get().subscribe(),
            Entry::Vacant(v) => {
                let (tx, rx) = broadcast::channel(FANOUT_CAPACITY);
                v.insert(tx);
                rx
            }
        };
        LedgerWatch { rx }
    }

    pub fn watch_errors(&self) -> broadcast::Receiver<ListenerError> {
        self.inner.errors.subscribe()
    }

    fn report_error(&self, message: String) {
        warn!(%message, "ledger change feed error");
        let _ = self.inner.errors.send(ListenerError {
            message,
            at: Utc::now(),
        });
    }
}

/// A live subscription to one user's ledger. Ends only when dropped or
/// explicitly unsubscribed; feed errors arrive on the hub's error
/// channel instead of closing the stream.
pub struct LedgerWatch {
    rx: broadcast::Receiver<LedgerSnapshot>,
}

impl LedgerWatch {
    /// Next snapshot, or `None` once unsubscribed. A slow consumer that
    /// lags the fan-out skips to the freshest snapshots rather than
    /// erroring out.
    pub async fn recv(&mut self) -> Option<LedgerSnapshot> {
        loop {
            match self.rx.recv().await {
                Ok(snapshot) => return Some(snapshot),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "ledger watch lagged, skipping to latest");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn unsubscribe(self) {}

    pub fn into_receiver(self) -> broadcast::Receiver<LedgerSnapshot> {
        self.rx
    }
}

/// Row image pushed by the `user_billing_changed` trigger. Timestamps
/// arrive as provider-native strings and are canonicalized to UTC here,
/// at the boundary, so consumers never branch on representation.
#[derive(Debug, Deserialize)]
struct ChangePayload {
    user_id: String,
    plan: String,
    subscription_credits: i64,
    extra_credits: i64,
    max_subscription_credits: i64,
    last_refill_at: Option<String>,
    next_refill_at: Option<String>,
    updated_at: String,
}

fn canonical_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|ts| ts.with_timezone(&Utc))
}

fn decode_change(payload: &str) -> anyhow::Result<LedgerSnapshot> {
    let change: ChangePayload = serde_json::from_str(payload)?;
    Ok(LedgerSnapshot {
        user_id: change.user_id,
        plan: change.plan,
        subscription_credits: change.subscription_credits,
        extra_credits: change.extra_credits,
        max_subscription_credits: change.max_subscription_credits,
        last_refill_at: change
            .last_refill_at
            .as_deref()
            .map(canonical_timestamp)
            .transpose()?,
        next_refill_at: change
            .next_refill_at
            .as_deref()
            .map(canonical_timestamp)
            .transpose()?,
        updated_at: canonical_timestamp(&change.updated_at)?,
    })
}

/// key: ledger-change-feed -> LISTEN/NOTIFY mirror into the hub
///
/// Subscribes to the store's change channel so this process sees writes
/// made by any process, not just its own. `PgListener` reconnects on its
/// own; each failure is reported on the error channel and the loop keeps
/// going.
pub fn spawn_change_listener(pool: PgPool, hub: LedgerHub) {
    tokio::spawn(async move {
        loop {
            let mut listener = match PgListener::connect_with(&pool).await {
                Ok(listener) => listener,
                Err(err) => {
                    hub.report_error(format!("change feed connect failed: {err}"));
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                    continue;
                }
            };
            if let Err(err) = listener.listen(CHANNEL).await {
                hub.report_error(format!("change feed listen failed: {err}"));
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                continue;
            }

            loop {
                match listener.recv().await {
                    Ok(notification) => match decode_change(notification.payload()) {
                        Ok(snapshot) => hub.publish(snapshot),
                        Err(err) => {
                            hub.report_error(format!("change feed payload decode failed: {err}"))
                        }
                    },
                    Err(err) => {
                        hub.report_error(format!("change feed receive failed: {err}"));
                        break;
                    }
                }
            }
        }
    });
}
