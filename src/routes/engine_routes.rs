// src/routes/engine_routes.rs
//
// Operator controls for the sequence engine. Every mutation goes through
// `Engine`, which serializes writers and holds the cross-instance lease.

use axum::{
    extract::{Query, State},
    routing::{get, patch, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    engine::{EngineConfigUpdate, EngineState, TickReport, TickTrigger},
    error::ApiError,
    import::{self, ImportOptions, ImportReport},
    middleware::auth_context::OperatorContext,
    models::{ApiOk, AppState},
};

use super::required_text;

pub fn router() -> Router<AppState> {
    Router::new()
        // /api/v1/engine
        .route("/", get(engine_status))
        .route("/config", patch(update_config))
        .route("/start", post(start_engine))
        .route("/stop", post(stop_engine))
        .route("/pause", post(pause_engine))
        .route("/resume", post(resume_engine))
        .route("/run-now", post(run_now))
        .route("/reset-counters", post(reset_counters))
        .route("/import-leads", post(import_leads))
}

type StateResponse = Result<Json<ApiOk<EngineState>>, ApiError>;

pub async fn engine_status(State(state): State<AppState>, _op: OperatorContext) -> StateResponse {
    Ok(Json(ApiOk {
        data: state.engine.status().await?,
    }))
}

pub async fn update_config(
    State(state): State<AppState>,
    op: OperatorContext,
    Json(req): Json<EngineConfigUpdate>,
) -> StateResponse {
    let updated = state.engine.update_config(req).await?;
    tracing::info!(
        operator = %op.token_fingerprint,
        daily_email_limit = updated.daily_email_limit,
        daily_sms_limit = updated.daily_sms_limit,
        monthly_budget_cents = updated.monthly_budget_cents,
        pause_threshold_percent = updated.pause_threshold_percent,
        "engine config updated"
    );
    Ok(Json(ApiOk { data: updated }))
}

pub async fn start_engine(State(state): State<AppState>, op: OperatorContext) -> StateResponse {
    tracing::info!(operator = %op.token_fingerprint, "engine start requested");
    Ok(Json(ApiOk {
        data: state.engine.start().await?,
    }))
}

pub async fn stop_engine(State(state): State<AppState>, op: OperatorContext) -> StateResponse {
    tracing::info!(operator = %op.token_fingerprint, "engine stop requested");
    Ok(Json(ApiOk {
        data: state.engine.stop().await?,
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct PauseRequest {
    pub reason: Option<String>,
}

pub async fn pause_engine(
    State(state): State<AppState>,
    _op: OperatorContext,
    body: Option<Json<PauseRequest>>,
) -> StateResponse {
    let reason = match body.and_then(|Json(b)| b.reason) {
        Some(r) => required_text(&r, "reason", 500)?,
        None => "paused by operator".to_string(),
    };
    Ok(Json(ApiOk {
        data: state.engine.pause(reason).await?,
    }))
}

pub async fn resume_engine(State(state): State<AppState>, op: OperatorContext) -> StateResponse {
    tracing::info!(operator = %op.token_fingerprint, "engine resume requested");
    Ok(Json(ApiOk {
        data: state.engine.resume().await?,
    }))
}

/// One tick now, even while stopped. A paused engine still refuses.
pub async fn run_now(
    State(state): State<AppState>,
    op: OperatorContext,
) -> Result<Json<ApiOk<TickReport>>, ApiError> {
    let report = state.engine.run_tick(Utc::now(), TickTrigger::Manual).await?;
    tracing::info!(
        operator = %op.token_fingerprint,
        ran = report.ran,
        sent = report.sent,
        "manual engine tick"
    );
    Ok(Json(ApiOk { data: report }))
}

pub async fn reset_counters(State(state): State<AppState>, op: OperatorContext) -> StateResponse {
    tracing::warn!(operator = %op.token_fingerprint, "engine counters reset");
    Ok(Json(ApiOk {
        data: state.engine.reset_counters().await?,
    }))
}

#[derive(Debug, Deserialize)]
pub struct EngineImportQuery {
    pub clinic_id: Option<Uuid>,
    #[serde(default)]
    pub dry_run: bool,
}

/// CSV import straight into the built-in GENIUS drip.
pub async fn import_leads(
    State(state): State<AppState>,
    op: OperatorContext,
    Query(q): Query<EngineImportQuery>,
    body: String,
) -> Result<Json<ApiOk<ImportReport>>, ApiError> {
    let opts = ImportOptions {
        clinic_id: q.clinic_id,
        sequence_id: None,
        enroll: true,
        dry_run: q.dry_run,
    };
    let report = import::import_leads(&state.db, body.as_bytes(), &opts, Utc::now()).await?;
    tracing::info!(
        operator = %op.token_fingerprint,
        imported = report.imported,
        rejected = report.rejected.len(),
        dry_run = report.dry_run,
        "engine lead import"
    );
    Ok(Json(ApiOk { data: report }))
}
