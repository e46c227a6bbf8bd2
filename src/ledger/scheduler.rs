use anyhow::Result;
use chrono::{DateTime, Months, Utc};
use sqlx::{FromRow, PgPool};
use tokio::time::{self, Duration as TokioDuration};
use tracing::{debug, info, warn};

use crate::config;

use super::catalog::Plan;
use super::service::LedgerService;

/// One refill period is one calendar month. `checked_add_months` keeps
/// the day-of-month where the target month has it and clamps otherwise
/// (Jan 31 -> Feb 28), which is exactly the billing-cycle behavior we
/// want instead of fixed 30-day windows.
pub fn period_after(at: DateTime<Utc>) -> DateTime<Utc> {
    at.checked_add_months(Months::new(1)).unwrap_or(at)
}

/// When the next refill is due: the scheduled timestamp if one was
/// recorded, otherwise one period after the last refill.
pub fn due_refill_at(
    last_refill_at: DateTime<Utc>,
    next_refill_at: Option<DateTime<Utc>>,
) -> DateTime<Utc> {
    next_refill_at.unwrap_or_else(|| period_after(last_refill_at))
}

/// key: refill-sweep -> background replenishment for offline users
pub fn spawn(pool: PgPool) {
    let interval = TokioDuration::from_secs(*config::REFILL_SCAN_INTERVAL_SECS);
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        loop {
            ticker.tick().await;
            let now = Utc::now();
            match process_tick(&pool, now).await {
                Ok(0) => {}
                Ok(refilled) => info!(refilled, "refill sweep replenished ledgers"),
                Err(err) => warn!(?err, "refill sweep tick failed"),
            }
        }
    });
}

#[derive(Debug, FromRow)]
struct RefillCandidate {
    user_id: String,
    plan: String,
}

/// Find ledgers whose refill is due and replenish each. The SQL filter
/// is only a pre-screen; `maybe_refill` re-checks under the row lock,
/// so a candidate refilled concurrently by another process becomes a
/// no-op here.
pub async fn process_tick(pool: &PgPool, now: DateTime<Utc>) -> Result<u32> {
    let service = LedgerService::new(pool.clone());
    let candidates = sqlx::query_as::<_, RefillCandidate>(
        r#"
        SELECT user_id, plan
        FROM user_billing
        WHERE plan <> 'free'
          AND (
            last_refill_at IS NULL
            OR COALESCE(next_refill_at, last_refill_at + INTERVAL '1 month') <= $1
          )
        "#,
    )
    .bind(now)
    .fetch_all(pool)
    .await?;

    let mut refilled = 0;
    for candidate in candidates {
        let plan = Plan::from_str_lenient(&candidate.plan);
        match service.maybe_refill(&candidate.user_id, plan, now).await {
            Ok(Some(_)) => refilled += 1,
            Ok(None) => debug!(
                user_id = %candidate.user_id,
                "refill candidate no longer due"
            ),
            Err(err) => warn!(
                ?err,
                user_id = %candidate.user_id,
                "failed to refill ledger"
            ),
        }
    }

    Ok(refilled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).single().unwrap()
    }

    #[test]
    fn period_preserves_day_of_month() {
        assert_eq!(period_after(utc(2026, 3, 15, 9)), utc(2026, 4, 15, 9));
    }

    #[test]
    fn period_clamps_short_months() {
        assert_eq!(period_after(utc(2026, 1, 31, 0)), utc(2026, 2, 28, 0));
        assert_eq!(period_after(utc(2024, 1, 31, 0)), utc(2024, 2, 29, 0));
    }

    #[test]
    fn period_rolls_over_year_end() {
        assert_eq!(period_after(utc(2026, 12, 10, 12)), utc(2027, 1, 10, 12));
    }

    #[test]
    fn due_prefers_recorded_schedule() {
        let last = utc(2026, 5, 1, 0);
        let scheduled = utc(2026, 6, 3, 0);
        assert_eq!(due_refill_at(last, Some(scheduled)), scheduled);
    }

    #[test]
    fn due_falls_back_to_one_period_after_last() {
        let last = utc(2026, 5, 1, 0);
        assert_eq!(due_refill_at(last, None), utc(2026, 6, 1, 0));
    }

    #[test]
    fn scheduling_from_due_date_does_not_drift() {
        // A refill processed three days late still schedules the next one
        // a calendar month after the original due date.
        let due = utc(2026, 7, 5, 0);
        assert_eq!(period_after(due), utc(2026, 8, 5, 0));
    }
}
