// src/routes/campaign_routes.rs

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{db_error, ApiError},
    lifecycle::CampaignStatus,
    middleware::auth_context::OperatorContext,
    models::{ok, ApiOk, AppState, CampaignRow, CampaignType, OkData},
};

use super::{
    deserialize_double_option,
    lead_routes::{apply_enrollment, resolve_enrollment},
    parse_field, required_text,
};

const CAMPAIGN_COLUMNS: &str = "campaign_id, name, campaign_type, status, sequence_id, total_sent, \
     sent_today, sent_today_date, created_at, updated_at";

const MAX_ENROLL_BATCH: usize = 1000;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/campaigns", get(list_campaigns).post(create_campaign))
        .route(
            "/campaigns/{campaign_id}",
            get(get_campaign).patch(update_campaign).delete(delete_campaign),
        )
        .route("/campaigns/{campaign_id}/status", post(set_campaign_status))
        .route("/campaigns/{campaign_id}/enroll", post(enroll_leads))
}

async fn fetch_campaign(state: &AppState, campaign_id: Uuid) -> Result<CampaignRow, ApiError> {
    sqlx::query_as::<_, CampaignRow>(&format!(
        "SELECT {CAMPAIGN_COLUMNS} FROM campaign WHERE campaign_id = $1"
    ))
    .bind(campaign_id)
    .fetch_optional(&state.db)
    .await
    .map_err(db_error)?
    .ok_or_else(|| ApiError::not_found("campaign"))
}

async fn ensure_sequence(state: &AppState, sequence_id: Option<Uuid>) -> Result<(), ApiError> {
    let Some(sid) = sequence_id else {
        return Ok(());
    };
    let exists: bool =
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM sequence WHERE sequence_id = $1)")
            .bind(sid)
            .fetch_one(&state.db)
            .await
            .map_err(db_error)?;
    if exists {
        Ok(())
    } else {
        Err(ApiError::not_found("sequence"))
    }
}

/* -------------------------
   CRUD
--------------------------*/

#[derive(Debug, Deserialize)]
pub struct ListCampaignsQuery {
    pub status: Option<String>,
}

pub async fn list_campaigns(
    State(state): State<AppState>,
    _op: OperatorContext,
    Query(q): Query<ListCampaignsQuery>,
) -> Result<Json<ApiOk<Vec<CampaignRow>>>, ApiError> {
    let status = q
        .status
        .as_deref()
        .map(parse_field::<CampaignStatus>)
        .transpose()?;

    let rows = sqlx::query_as::<_, CampaignRow>(&format!(
        r#"
        SELECT {CAMPAIGN_COLUMNS}
        FROM campaign
        WHERE ($1::text IS NULL OR status = $1)
        ORDER BY created_at DESC
        "#
    ))
    .bind(status)
    .fetch_all(&state.db)
    .await
    .map_err(db_error)?;

    Ok(Json(ApiOk { data: rows }))
}

pub async fn get_campaign(
    State(state): State<AppState>,
    _op: OperatorContext,
    Path(campaign_id): Path<Uuid>,
) -> Result<Json<ApiOk<CampaignRow>>, ApiError> {
    Ok(Json(ApiOk {
        data: fetch_campaign(&state, campaign_id).await?,
    }))
}

#[derive(Debug, Deserialize)]
pub struct CreateCampaignRequest {
    pub name: String,
    pub campaign_type: CampaignType,
    pub sequence_id: Option<Uuid>,
}

/// New campaigns start in `draft`.
pub async fn create_campaign(
    State(state): State<AppState>,
    _op: OperatorContext,
    Json(req): Json<CreateCampaignRequest>,
) -> Result<Json<ApiOk<CampaignRow>>, ApiError> {
    let name = required_text(&req.name, "name", 128)?;
    ensure_sequence(&state, req.sequence_id).await?;

    let row = sqlx::query_as::<_, CampaignRow>(&format!(
        r#"
        INSERT INTO campaign (name, campaign_type, status, sequence_id)
        VALUES ($1, $2, $3, $4)
        RETURNING {CAMPAIGN_COLUMNS}
        "#
    ))
    .bind(name)
    .bind(req.campaign_type)
    .bind(CampaignStatus::Draft)
    .bind(req.sequence_id)
    .fetch_one(&state.db)
    .await
    .map_err(db_error)?;

    tracing::info!(campaign_id = %row.campaign_id, "campaign created");
    Ok(Json(ApiOk { data: row }))
}

#[derive(Debug, Deserialize)]
pub struct UpdateCampaignRequest {
    pub name: Option<String>,
    pub campaign_type: Option<CampaignType>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub sequence_id: Option<Option<Uuid>>,
}

/// Type and sequence are frozen once a campaign has gone live.
pub async fn update_campaign(
    State(state): State<AppState>,
    _op: OperatorContext,
    Path(campaign_id): Path<Uuid>,
    Json(req): Json<UpdateCampaignRequest>,
) -> Result<Json<ApiOk<CampaignRow>>, ApiError> {
    let existing = fetch_campaign(&state, campaign_id).await?;
    let editable = matches!(existing.status, CampaignStatus::Draft | CampaignStatus::Ready);

    let name = match req.name.as_deref() {
        Some(n) => required_text(n, "name", 128)?,
        None => existing.name,
    };
    let campaign_type = match req.campaign_type {
        Some(t) if t != existing.campaign_type && !editable => {
            return Err(ApiError::Conflict(
                "CAMPAIGN_LOCKED",
                format!("campaign_type cannot change while {}", existing.status),
            ))
        }
        Some(t) => t,
        None => existing.campaign_type,
    };
    let sequence_id = match req.sequence_id {
        None => existing.sequence_id,
        Some(v) if v != existing.sequence_id && !editable => {
            return Err(ApiError::Conflict(
                "CAMPAIGN_LOCKED",
                format!("sequence_id cannot change while {}", existing.status),
            ))
        }
        Some(v) => {
            ensure_sequence(&state, v).await?;
            v
        }
    };

    let row = sqlx::query_as::<_, CampaignRow>(&format!(
        r#"
        UPDATE campaign
        SET name = $2, campaign_type = $3, sequence_id = $4, updated_at = now()
        WHERE campaign_id = $1
        RETURNING {CAMPAIGN_COLUMNS}
        "#
    ))
    .bind(campaign_id)
    .bind(name)
    .bind(campaign_type)
    .bind(sequence_id)
    .fetch_one(&state.db)
    .await
    .map_err(db_error)?;

    Ok(Json(ApiOk { data: row }))
}

pub async fn delete_campaign(
    State(state): State<AppState>,
    _op: OperatorContext,
    Path(campaign_id): Path<Uuid>,
) -> Result<Json<ApiOk<OkData>>, ApiError> {
    let existing = fetch_campaign(&state, campaign_id).await?;
    if !existing.status.is_deletable() {
        return Err(ApiError::Conflict(
            "CAMPAIGN_NOT_DELETABLE",
            format!("a {} campaign cannot be deleted", existing.status),
        ));
    }

    // the status guard covers a concurrent transition
    let deleted = sqlx::query(
        "DELETE FROM campaign WHERE campaign_id = $1 AND status IN ('draft', 'archived')",
    )
    .bind(campaign_id)
    .execute(&state.db)
    .await
    .map_err(db_error)?
    .rows_affected();

    if deleted == 0 {
        return Err(ApiError::Conflict(
            "CAMPAIGN_NOT_DELETABLE",
            "campaign changed status; retry".into(),
        ));
    }
    tracing::info!(%campaign_id, "campaign deleted");
    Ok(Json(ok()))
}

/* -------------------------
   POST /campaigns/{id}/status
--------------------------*/

#[derive(Debug, Deserialize)]
pub struct CampaignStatusRequest {
    pub status: String,
}

pub async fn set_campaign_status(
    State(state): State<AppState>,
    op: OperatorContext,
    Path(campaign_id): Path<Uuid>,
    Json(req): Json<CampaignStatusRequest>,
) -> Result<Json<ApiOk<CampaignRow>>, ApiError> {
    let target = parse_field::<CampaignStatus>(&req.status)?;
    let existing = fetch_campaign(&state, campaign_id).await?;

    if existing.status == target {
        return Ok(Json(ApiOk { data: existing }));
    }
    if !existing.status.can_transition_to(target) {
        return Err(ApiError::Conflict(
            "INVALID_TRANSITION",
            format!("campaign cannot move from {} to {target}", existing.status),
        ));
    }

    let row = sqlx::query_as::<_, CampaignRow>(&format!(
        r#"
        UPDATE campaign
        SET status = $3, updated_at = now()
        WHERE campaign_id = $1 AND status = $2
        RETURNING {CAMPAIGN_COLUMNS}
        "#
    ))
    .bind(campaign_id)
    .bind(existing.status)
    .bind(target)
    .fetch_optional(&state.db)
    .await
    .map_err(db_error)?
    .ok_or_else(|| {
        ApiError::Conflict("INVALID_TRANSITION", "campaign changed status; retry".into())
    })?;

    tracing::info!(
        %campaign_id,
        from = %existing.status,
        to = %target,
        operator = %op.token_fingerprint,
        "campaign status changed"
    );
    Ok(Json(ApiOk { data: row }))
}

/* -------------------------
   POST /campaigns/{id}/enroll
--------------------------*/

#[derive(Debug, Deserialize)]
pub struct EnrollLeadsRequest {
    pub lead_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct SkippedLead {
    pub lead_id: Uuid,
    pub reason: &'static str,
}

#[derive(Debug, Default, Serialize)]
pub struct EnrollReport {
    pub enrolled: Vec<Uuid>,
    pub skipped: Vec<SkippedLead>,
}

/// Enrolls each listed lead on the campaign's sequence. Leads that are
/// missing or no longer eligible are reported, not failed.
pub async fn enroll_leads(
    State(state): State<AppState>,
    _op: OperatorContext,
    Path(campaign_id): Path<Uuid>,
    Json(req): Json<EnrollLeadsRequest>,
) -> Result<Json<ApiOk<EnrollReport>>, ApiError> {
    if req.lead_ids.is_empty() {
        return Err(ApiError::validation("lead_ids is required"));
    }
    if req.lead_ids.len() > MAX_ENROLL_BATCH {
        return Err(ApiError::validation(format!(
            "at most {MAX_ENROLL_BATCH} leads per request"
        )));
    }

    let enrollment = resolve_enrollment(&state.db, None, Some(campaign_id), Utc::now()).await?;

    let mut report = EnrollReport::default();
    let mut seen = std::collections::HashSet::new();
    for lead_id in req.lead_ids {
        if !seen.insert(lead_id) {
            continue;
        }
        match apply_enrollment(&state.db, lead_id, &enrollment).await? {
            Some(_) => report.enrolled.push(lead_id),
            None => {
                let exists: bool =
                    sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM lead WHERE lead_id = $1)")
                        .bind(lead_id)
                        .fetch_one(&state.db)
                        .await
                        .map_err(db_error)?;
                report.skipped.push(SkippedLead {
                    lead_id,
                    reason: if exists { "not_eligible" } else { "not_found" },
                });
            }
        }
    }

    tracing::info!(
        %campaign_id,
        enrolled = report.enrolled.len(),
        skipped = report.skipped.len(),
        "campaign enrollment"
    );
    Ok(Json(ApiOk { data: report }))
}
