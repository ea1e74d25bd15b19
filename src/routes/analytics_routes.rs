// src/routes/analytics_routes.rs

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::{
    error::{db_error, ApiError},
    middleware::auth_context::OperatorContext,
    models::{ApiOk, AppState},
};

const DEFAULT_WINDOW_DAYS: i32 = 30;

pub fn router() -> Router<AppState> {
    Router::new().route("/analytics/leads", get(lead_summary))
}

#[derive(Debug, Serialize, FromRow)]
pub struct CountRow {
    pub key: String,
    pub count: i64,
}

#[derive(Debug, Serialize, FromRow)]
pub struct ChannelSends {
    pub channel: String,
    pub sent: i64,
    pub failed: i64,
    pub skipped: i64,
    pub cost_cents: i64,
}

#[derive(Debug, Serialize)]
pub struct LeadSummary {
    pub total: i64,
    pub enrolled: i64,
    pub by_status: Vec<CountRow>,
    pub by_source: Vec<CountRow>,
    pub window_days: i32,
    pub sends_by_channel: Vec<ChannelSends>,
}

#[derive(Debug, Deserialize)]
pub struct SummaryQuery {
    pub clinic_id: Option<Uuid>,
    pub days: Option<i32>,
}

pub async fn lead_summary(
    State(state): State<AppState>,
    _op: OperatorContext,
    Query(q): Query<SummaryQuery>,
) -> Result<Json<ApiOk<LeadSummary>>, ApiError> {
    let window_days = q.days.unwrap_or(DEFAULT_WINDOW_DAYS).clamp(1, 365);

    let by_status = sqlx::query_as::<_, CountRow>(
        r#"
        SELECT status AS key, COUNT(*) AS count
        FROM lead
        WHERE ($1::uuid IS NULL OR clinic_id = $1)
        GROUP BY status
        ORDER BY count DESC
        "#,
    )
    .bind(q.clinic_id)
    .fetch_all(&state.db)
    .await
    .map_err(db_error)?;

    let by_source = sqlx::query_as::<_, CountRow>(
        r#"
        SELECT source AS key, COUNT(*) AS count
        FROM lead
        WHERE ($1::uuid IS NULL OR clinic_id = $1)
        GROUP BY source
        ORDER BY count DESC
        "#,
    )
    .bind(q.clinic_id)
    .fetch_all(&state.db)
    .await
    .map_err(db_error)?;

    let enrolled: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*)
        FROM lead
        WHERE next_due_at IS NOT NULL
          AND ($1::uuid IS NULL OR clinic_id = $1)
        "#,
    )
    .bind(q.clinic_id)
    .fetch_one(&state.db)
    .await
    .map_err(db_error)?;

    let sends_by_channel = sqlx::query_as::<_, ChannelSends>(
        r#"
        SELECT m.channel,
               COUNT(*) FILTER (WHERE m.outcome = 'sent')    AS sent,
               COUNT(*) FILTER (WHERE m.outcome = 'failed')  AS failed,
               COUNT(*) FILTER (WHERE m.outcome = 'skipped') AS skipped,
               COALESCE(SUM(m.cost_cents), 0)::bigint        AS cost_cents
        FROM message_log m
        JOIN lead l ON l.lead_id = m.lead_id
        WHERE m.created_at >= now() - make_interval(days => $2)
          AND ($1::uuid IS NULL OR l.clinic_id = $1)
        GROUP BY m.channel
        ORDER BY m.channel
        "#,
    )
    .bind(q.clinic_id)
    .bind(window_days)
    .fetch_all(&state.db)
    .await
    .map_err(db_error)?;

    let total = by_status.iter().map(|r| r.count).sum();

    Ok(Json(ApiOk {
        data: LeadSummary {
            total,
            enrolled,
            by_status,
            by_source,
            window_days,
            sends_by_channel,
        },
    }))
}
