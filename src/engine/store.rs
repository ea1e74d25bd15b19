use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::lifecycle::LeadStatus;
use crate::models::{Channel, LeadRow, MessageOutcome, LEAD_COLUMNS};

use super::plan::{self, SequencePlan};
use super::{EngineError, EngineState};

/// Arbitrary key shared by every instance for `pg_advisory_xact_lock`.
const ENGINE_LOCK_KEY: i64 = 0x5349_4c45_5049_5045;

/// Cross-instance single-writer lease. For Postgres this is an open
/// transaction holding a transaction-scoped advisory lock; dropping it rolls
/// back and frees the lock.
pub struct EngineLease {
    tx: Option<Transaction<'static, Postgres>>,
}

impl EngineLease {
    #[cfg(test)]
    pub fn local() -> Self {
        Self { tx: None }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageEntry {
    pub lead_id: Uuid,
    pub campaign_id: Option<Uuid>,
    pub channel: Channel,
    pub template_key: String,
    pub sequence_day: i32,
    pub outcome: MessageOutcome,
    pub provider_message_id: Option<String>,
    pub error: Option<String>,
    pub cost_cents: i64,
}

/// Everything that changes on a lead when a step is sent or skipped.
///
/// `status` only lands if the lead still has `observed_status`, and
/// `next_due_at` only if the lead still accepts automation. An operator
/// edit or unsubscribe that arrives mid-send wins.
#[derive(Debug, Clone, PartialEq)]
pub struct StepCommit {
    pub lead_id: Uuid,
    pub observed_status: LeadStatus,
    pub status: LeadStatus,
    pub contacted_at: Option<DateTime<Utc>>,
    pub last_sent_at: Option<DateTime<Utc>>,
    pub sequence_day: i32,
    pub next_due_at: Option<DateTime<Utc>>,
    pub message: MessageEntry,
    pub today: NaiveDate,
}

#[async_trait]
pub trait EngineStore: Send + Sync {
    /// `wait = false` returns `None` when another instance holds the lease.
    async fn acquire_lease(&self, wait: bool) -> Result<Option<EngineLease>, EngineError>;
    async fn release_lease(&self, lease: EngineLease) -> Result<(), EngineError>;

    async fn load_state(&self) -> Result<EngineState, EngineError>;
    async fn save_state(&self, state: &EngineState) -> Result<(), EngineError>;

    async fn due_leads(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<LeadRow>, EngineError>;
    async fn load_plan(&self, sequence_id: Option<Uuid>) -> Result<SequencePlan, EngineError>;
    async fn clinic_name(&self, clinic_id: Uuid) -> Result<Option<String>, EngineError>;

    /// Clears the schedule of a lead that finished or left the funnel.
    async fn halt_lead(&self, lead_id: Uuid) -> Result<(), EngineError>;
    /// Applies a step result, its message log row and the engine counters
    /// atomically.
    async fn commit_step(&self, commit: &StepCommit, state: &EngineState) -> Result<(), EngineError>;
    async fn record_failure(&self, entry: &MessageEntry) -> Result<(), EngineError>;
}

pub struct PgEngineStore {
    db: PgPool,
}

impl PgEngineStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

const STATE_COLUMNS: &str = "is_running, is_paused, pause_reason, daily_email_limit, daily_sms_limit, \
     monthly_budget_cents, pause_threshold_percent, cost_per_email_cents, cost_per_sms_cents, \
     cost_per_whatsapp_cents, emails_sent_today, sms_sent_today, counters_date, \
     month_spend_cents, spend_month, total_sent, last_run_at";

async fn write_state<'e, E>(executor: E, state: &EngineState) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        UPDATE engine_state
        SET is_running = $1,
            is_paused = $2,
            pause_reason = $3,
            daily_email_limit = $4,
            daily_sms_limit = $5,
            monthly_budget_cents = $6,
            pause_threshold_percent = $7,
            cost_per_email_cents = $8,
            cost_per_sms_cents = $9,
            cost_per_whatsapp_cents = $10,
            emails_sent_today = $11,
            sms_sent_today = $12,
            counters_date = $13,
            month_spend_cents = $14,
            spend_month = $15,
            total_sent = $16,
            last_run_at = $17
        WHERE singleton_id = TRUE
        "#,
    )
    .bind(state.is_running)
    .bind(state.is_paused)
    .bind(&state.pause_reason)
    .bind(state.daily_email_limit)
    .bind(state.daily_sms_limit)
    .bind(state.monthly_budget_cents)
    .bind(state.pause_threshold_percent)
    .bind(state.cost_per_email_cents)
    .bind(state.cost_per_sms_cents)
    .bind(state.cost_per_whatsapp_cents)
    .bind(state.emails_sent_today)
    .bind(state.sms_sent_today)
    .bind(state.counters_date)
    .bind(state.month_spend_cents)
    .bind(&state.spend_month)
    .bind(state.total_sent)
    .bind(state.last_run_at)
    .execute(executor)
    .await?;
    Ok(())
}

async fn insert_message<'e, E>(executor: E, entry: &MessageEntry) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO message_log (
          lead_id, campaign_id, channel, template_key, sequence_day,
          outcome, provider_message_id, error, cost_cents
        )
        VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)
        "#,
    )
    .bind(entry.lead_id)
    .bind(entry.campaign_id)
    .bind(entry.channel)
    .bind(&entry.template_key)
    .bind(entry.sequence_day)
    .bind(entry.outcome)
    .bind(&entry.provider_message_id)
    .bind(&entry.error)
    .bind(entry.cost_cents)
    .execute(executor)
    .await?;
    Ok(())
}

#[async_trait]
impl EngineStore for PgEngineStore {
    async fn acquire_lease(&self, wait: bool) -> Result<Option<EngineLease>, EngineError> {
        let mut tx = self.db.begin().await?;
        if wait {
            sqlx::query("SELECT pg_advisory_xact_lock($1)")
                .bind(ENGINE_LOCK_KEY)
                .execute(&mut *tx)
                .await?;
        } else {
            let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_xact_lock($1)")
                .bind(ENGINE_LOCK_KEY)
                .fetch_one(&mut *tx)
                .await?;
            if !locked {
                tx.rollback().await?;
                return Ok(None);
            }
        }
        Ok(Some(EngineLease { tx: Some(tx) }))
    }

    async fn release_lease(&self, lease: EngineLease) -> Result<(), EngineError> {
        if let Some(tx) = lease.tx {
            tx.commit().await?;
        }
        Ok(())
    }

    async fn load_state(&self) -> Result<EngineState, EngineError> {
        let state = sqlx::query_as::<_, EngineState>(&format!(
            "SELECT {STATE_COLUMNS} FROM engine_state WHERE singleton_id = TRUE"
        ))
        .fetch_optional(&self.db)
        .await?;

        match state {
            Some(state) => Ok(state),
            None => {
                // Row is seeded by the migration; recreate it if someone removed it.
                let state = sqlx::query_as::<_, EngineState>(&format!(
                    "INSERT INTO engine_state (singleton_id) VALUES (TRUE) \
                     ON CONFLICT (singleton_id) DO UPDATE SET singleton_id = TRUE \
                     RETURNING {STATE_COLUMNS}"
                ))
                .fetch_one(&self.db)
                .await?;
                Ok(state)
            }
        }
    }

    async fn save_state(&self, state: &EngineState) -> Result<(), EngineError> {
        write_state(&self.db, state).await?;
        Ok(())
    }

    async fn due_leads(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<LeadRow>, EngineError> {
        let columns = LEAD_COLUMNS
            .split(", ")
            .map(|c| format!("l.{}", c.trim()))
            .collect::<Vec<_>>()
            .join(", ");
        let rows = sqlx::query_as::<_, LeadRow>(&format!(
            r#"
            SELECT {columns}
            FROM lead l
            LEFT JOIN campaign c ON c.campaign_id = l.campaign_id
            LEFT JOIN sequence s ON s.sequence_id = l.sequence_id
            WHERE l.next_due_at IS NOT NULL
              AND l.next_due_at <= $1
              AND (l.campaign_id IS NULL OR c.status = 'active')
              AND (l.sequence_id IS NULL OR s.is_active)
            ORDER BY l.next_due_at ASC
            LIMIT $2
            "#
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }

    async fn load_plan(&self, sequence_id: Option<Uuid>) -> Result<SequencePlan, EngineError> {
        plan::load_plan(&self.db, sequence_id).await
    }

    async fn clinic_name(&self, clinic_id: Uuid) -> Result<Option<String>, EngineError> {
        let name: Option<String> =
            sqlx::query_scalar("SELECT name FROM clinic WHERE clinic_id = $1")
                .bind(clinic_id)
                .fetch_optional(&self.db)
                .await?;
        Ok(name)
    }

    async fn halt_lead(&self, lead_id: Uuid) -> Result<(), EngineError> {
        sqlx::query("UPDATE lead SET next_due_at = NULL, updated_at = now() WHERE lead_id = $1")
            .bind(lead_id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn commit_step(&self, commit: &StepCommit, state: &EngineState) -> Result<(), EngineError> {
        let mut tx = self.db.begin().await?;

        // Guard on sequence_day so a concurrent manual edit is not overwritten.
        let updated = sqlx::query(
            r#"
            UPDATE lead
            SET status = CASE WHEN status = $8 THEN $2 ELSE status END,
                contacted_at = COALESCE(contacted_at, $3),
                last_sent_at = $4,
                sequence_day = $5,
                next_due_at = CASE WHEN status = ANY($9) THEN $6 ELSE NULL END,
                updated_at = now()
            WHERE lead_id = $1
              AND sequence_day = $7
            "#,
        )
        .bind(commit.lead_id)
        .bind(commit.status)
        .bind(commit.contacted_at)
        .bind(commit.last_sent_at)
        .bind(commit.sequence_day)
        .bind(commit.next_due_at)
        .bind(commit.message.sequence_day)
        .bind(commit.observed_status)
        .bind(LeadStatus::automated_labels())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            tracing::warn!(lead_id = %commit.lead_id, "lead changed during send; keeping manual edit");
        }

        insert_message(&mut *tx, &commit.message).await?;

        if let (Some(campaign_id), MessageOutcome::Sent) = (commit.message.campaign_id, commit.message.outcome) {
            sqlx::query(
                r#"
                UPDATE campaign
                SET total_sent = total_sent + 1,
                    sent_today = CASE WHEN sent_today_date = $2 THEN sent_today + 1 ELSE 1 END,
                    sent_today_date = $2,
                    updated_at = now()
                WHERE campaign_id = $1
                "#,
            )
            .bind(campaign_id)
            .bind(commit.today)
            .execute(&mut *tx)
            .await?;
        }

        write_state(&mut *tx, state).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn record_failure(&self, entry: &MessageEntry) -> Result<(), EngineError> {
        insert_message(&self.db, entry).await?;
        Ok(())
    }
}
