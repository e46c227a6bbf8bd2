use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

use super::catalog::{plan_config, resolve_plan, Plan};
use super::models::{CreditLedger, DebitOutcome, EntitlementSnapshot, LedgerEventKind};
use super::scheduler::{due_refill_at, period_after};

/// Bounded retry for serialized row-lock conflicts before surfacing
/// `Conflict` to the caller.
const CONFLICT_RETRIES: u32 = 3;

/// key: ledger-service -> debit,refill,reconcile against user_billing
#[derive(Clone)]
pub struct LedgerService {
    pool: PgPool,
}

impl LedgerService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn fetch(&self, user_id: &str) -> AppResult<Option<CreditLedger>> {
        let record =
            sqlx::query_as::<_, CreditLedger>("SELECT * FROM user_billing WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(record)
    }

    /// Atomically spend `cost` credits, subscription pool first. The row
    /// lock taken by `FOR UPDATE` is the serialization point: a racing
    /// debit or refill on the same user waits for this commit and then
    /// sees the decremented balances.
    pub async fn debit(&self, user_id: &str, cost: i64) -> AppResult<DebitOutcome> {
        if cost <= 0 {
            return Err(AppError::BadRequest("cost must be positive".into()));
        }

        let mut attempt = 0;
        loop {
            match self.debit_once(user_id, cost).await {
                Err(AppError::Db(err)) if is_serialization_conflict(&err) => {
                    attempt += 1;
                    if attempt > CONFLICT_RETRIES {
                        return Err(AppError::Conflict);
                    }
                    debug!(%user_id, attempt, "debit transaction conflicted, retrying");
                }
                other => return other,
            }
        }
    }

    async fn debit_once(&self, user_id: &str, cost: i64) -> AppResult<DebitOutcome> {
        let mut tx = self.pool.begin().await?;

        let ledger = lock_ledger(&mut tx, user_id).await?;
        let Some(ledger) = ledger else {
            return Err(AppError::NoLedger);
        };

        let total = ledger.total_credits();
        if total < cost {
            // Roll back without any mutation; the caller branches on this.
            return Err(AppError::InsufficientCredits {
                available: total,
                requested: cost,
            });
        }

        let subscription_spent = ledger.subscription_credits.min(cost);
        let extra_spent = cost - subscription_spent;

        let updated = sqlx::query_as::<_, CreditLedger>(
            r#"
            UPDATE user_billing
            SET subscription_credits = subscription_credits - $1,
                extra_credits = extra_credits - $2,
                updated_at = NOW()
            WHERE user_id = $3
            RETURNING *
            "#,
        )
        .bind(subscription_spent)
        .bind(extra_spent)
        .bind(user_id)
        .fetch_one(&mut tx)
        .await?;

        record_event(&mut tx, &updated, LedgerEventKind::Debit, -cost).await?;
        tx.commit().await?;

        info!(
            %user_id,
            cost,
            subscription_spent,
            extra_spent,
            remaining = updated.total_credits(),
            "debit committed"
        );

        Ok(DebitOutcome {
            cost,
            subscription_spent,
            extra_spent,
            ledger: updated,
        })
    }

    /// Replenish subscription credits if a refill is due. Idempotent:
    /// calling at any time when no refill is due is a no-op, and the row
    /// lock prevents two racing invocations from double-crediting.
    pub async fn maybe_refill(
        &self,
        user_id: &str,
        plan: Plan,
        now: DateTime<Utc>,
    ) -> AppResult<Option<CreditLedger>> {
        let config = plan_config(plan);
        if config.monthly_credits == 0 {
            return Ok(None);
        }

        let mut tx = self.pool.begin().await?;
        let Some(ledger) = lock_ledger(&mut tx, user_id).await? else {
            return Ok(None);
        };

        let (credits, next_refill_at) = match ledger.last_refill_at {
            // Never refilled: immediate first grant.
            None => (config.monthly_credits, period_after(now)),
            Some(last_refill_at) => {
                let due_at = due_refill_at(last_refill_at, ledger.next_refill_at);
                if now < due_at {
                    return Ok(None);
                }
                // Rollover: unused credits carry over up to the cap. The next
                // due date advances from the schedule, not from now, so a late
                // invocation does not drift the refill day.
                let credits = (ledger.subscription_credits + config.monthly_credits)
                    .min(config.max_subscription_credits);
                (credits, period_after(due_at))
            }
        };

        let updated = sqlx::query_as::<_, CreditLedger>(
            r#"
            UPDATE user_billing
            SET subscription_credits = $1,
                max_subscription_credits = $2,
                last_refill_at = $3,
                next_refill_at = $4,
                updated_at = NOW()
            WHERE user_id = $5
            RETURNING *
            "#,
        )
        .bind(credits)
        .bind(config.max_subscription_credits)
        .bind(now)
        .bind(next_refill_at)
        .bind(user_id)
        .fetch_one(&mut tx)
        .await?;

        let granted = updated.subscription_credits - ledger.subscription_credits;
        record_event(&mut tx, &updated, LedgerEventKind::Refill, granted).await?;
        tx.commit().await?;

        info!(
            %user_id,
            plan = plan.as_str(),
            granted,
            next_refill_at = %next_refill_at,
            "subscription credits refilled"
        );
        Ok(Some(updated))
    }

    /// Mirror the provider's entitlement state into the ledger. Creates
    /// the record on first sight (with the plan's first grant); for an
    /// existing record only plan, cap and the raw snapshot change — credit
    /// balances and refill timing belong to debit/refill alone.
    pub async fn reconcile(
        &self,
        user_id: &str,
        snapshot: &EntitlementSnapshot,
        now: DateTime<Utc>,
    ) -> AppResult<CreditLedger> {
        let plan = resolve_plan(snapshot.active_ids());
        let config = plan_config(plan);
        let raw = serde_json::to_value(&snapshot.active)
            .map_err(|err| AppError::Message(format!("entitlement snapshot encoding: {err}")))?;

        let mut tx = self.pool.begin().await?;
        let existing = lock_ledger(&mut tx, user_id).await?;

        let (updated, kind) = match existing {
            None => {
                let created = sqlx::query_as::<_, CreditLedger>(
                    r#"
                    INSERT INTO user_billing (
                        user_id,
                        plan,
                        subscription_credits,
                        extra_credits,
                        max_subscription_credits,
                        last_refill_at,
                        next_refill_at,
                        entitlements,
                        platform,
                        rc_customer_id
                    ) VALUES ($1, $2, $3, 0, $4, $5, NULL, $6, $7, $8)
                    RETURNING *
                    "#,
                )
                .bind(user_id)
                .bind(plan.as_str())
                .bind(config.monthly_credits)
                .bind(config.max_subscription_credits)
                .bind(now)
                .bind(&raw)
                .bind(&snapshot.platform)
                .bind(&snapshot.rc_customer_id)
                .fetch_one(&mut tx)
                .await?;
                (created, LedgerEventKind::Create)
            }
            Some(previous) => {
                if previous.plan != plan.as_str() {
                    info!(
                        %user_id,
                        from = %previous.plan,
                        to = plan.as_str(),
                        "plan change reconciled from entitlement provider"
                    );
                }
                let updated = sqlx::query_as::<_, CreditLedger>(
                    r#"
                    UPDATE user_billing
                    SET plan = $1,
                        max_subscription_credits = $2,
                        entitlements = $3,
                        platform = COALESCE($4, platform),
                        rc_customer_id = COALESCE($5, rc_customer_id),
                        updated_at = NOW()
                    WHERE user_id = $6
                    RETURNING *
                    "#,
                )
                .bind(plan.as_str())
                .bind(config.max_subscription_credits)
                .bind(&raw)
                .bind(&snapshot.platform)
                .bind(&snapshot.rc_customer_id)
                .bind(user_id)
                .fetch_one(&mut tx)
                .await?;
                (updated, LedgerEventKind::Reconcile)
            }
        };

        record_event(&mut tx, &updated, kind, 0).await?;
        tx.commit().await?;
        Ok(updated)
    }
}

async fn lock_ledger(
    tx: &mut Transaction<'_, Postgres>,
    user_id: &str,
) -> Result<Option<CreditLedger>, sqlx::Error> {
    sqlx::query_as::<_, CreditLedger>("SELECT * FROM user_billing WHERE user_id = $1 FOR UPDATE")
        .bind(user_id)
        .fetch_optional(tx)
        .await
}

async fn record_event(
    tx: &mut Transaction<'_, Postgres>,
    ledger: &CreditLedger,
    kind: LedgerEventKind,
    amount: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO ledger_events (
            id, user_id, kind, amount, subscription_credits_after, extra_credits_after
        ) VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&ledger.user_id)
    .bind(kind.as_str())
    .bind(amount)
    .bind(ledger.subscription_credits)
    .bind(ledger.extra_credits)
    .execute(tx)
    .await?;
    Ok(())
}

fn is_serialization_conflict(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => matches!(
            db_err.code().as_deref(),
            Some("40001") | Some("40P01")
        ),
        _ => false,
    }
}
