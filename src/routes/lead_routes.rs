// src/routes/lead_routes.rs

use axum::{
    extract::{Path, Query, State},
    routing::{get, patch, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    engine::plan::{self, SequencePlan},
    error::{db_error, ApiError},
    import::{self, ImportOptions, ImportReport},
    lifecycle::{CampaignStatus, LeadStatus, Transition},
    middleware::auth_context::OperatorContext,
    models::{
        clean_opt, is_plausible_email, normalize_phone, ApiOk, AppState, CampaignRow, LeadRow,
        LeadSource, MessageLogRow, LEAD_COLUMNS,
    },
};

use super::{deserialize_double_option, page, parse_field, required_text};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/leads", get(list_leads).post(create_lead))
        .route("/leads/import", post(import_leads_csv))
        .route("/leads/{lead_id}", get(get_lead).patch(update_lead))
        .route("/leads/{lead_id}/status", patch(update_lead_status))
        .route("/leads/{lead_id}/enroll", post(enroll_lead))
        .route("/leads/{lead_id}/unenroll", post(unenroll_lead))
        .route("/leads/{lead_id}/messages", get(list_lead_messages))
}

/* -------------------------
   Shared helpers
--------------------------*/

pub(crate) async fn fetch_lead(db: &PgPool, lead_id: Uuid) -> Result<LeadRow, ApiError> {
    sqlx::query_as::<_, LeadRow>(&format!("SELECT {LEAD_COLUMNS} FROM lead WHERE lead_id = $1"))
        .bind(lead_id)
        .fetch_optional(db)
        .await
        .map_err(db_error)?
        .ok_or_else(|| ApiError::not_found("lead"))
}

fn checked_email(raw: Option<String>) -> Result<Option<String>, ApiError> {
    match clean_opt(raw) {
        Some(e) if is_plausible_email(&e) => Ok(Some(e.to_ascii_lowercase())),
        Some(_) => Err(ApiError::validation("email is invalid")),
        None => Ok(None),
    }
}

fn checked_phone(raw: Option<String>) -> Result<Option<String>, ApiError> {
    clean_opt(raw)
        .map(|p| {
            normalize_phone(&p)
                .ok_or_else(|| ApiError::validation("phone must have 7 to 15 digits"))
        })
        .transpose()
}

/// Where a newly enrolled lead goes and when its first step is due.
#[derive(Debug, Clone)]
pub(crate) struct Enrollment {
    pub sequence_id: Option<Uuid>,
    pub campaign_id: Option<Uuid>,
    pub enrolled_at: DateTime<Utc>,
    pub first_due: DateTime<Utc>,
}

/// Inactive sequences accept no new enrollments, from any entry point.
fn sequence_gate(active: Option<bool>) -> Result<(), ApiError> {
    match active {
        None => Err(ApiError::not_found("sequence")),
        Some(false) => Err(ApiError::Conflict(
            "SEQUENCE_INACTIVE",
            "sequence is not active".into(),
        )),
        Some(true) => Ok(()),
    }
}

pub(crate) async fn ensure_sequence_open(db: &PgPool, sequence_id: Uuid) -> Result<(), ApiError> {
    let active: Option<bool> =
        sqlx::query_scalar("SELECT is_active FROM sequence WHERE sequence_id = $1")
            .bind(sequence_id)
            .fetch_optional(db)
            .await
            .map_err(db_error)?;
    sequence_gate(active)
}

pub(crate) async fn resolve_enrollment(
    db: &PgPool,
    sequence_id: Option<Uuid>,
    campaign_id: Option<Uuid>,
    now: DateTime<Utc>,
) -> Result<Enrollment, ApiError> {
    let mut sequence_id = sequence_id;

    if let Some(cid) = campaign_id {
        let campaign = sqlx::query_as::<_, CampaignRow>(
            r#"
            SELECT campaign_id, name, campaign_type, status, sequence_id, total_sent,
                   sent_today, sent_today_date, created_at, updated_at
            FROM campaign
            WHERE campaign_id = $1
            "#,
        )
        .bind(cid)
        .fetch_optional(db)
        .await
        .map_err(db_error)?
        .ok_or_else(|| ApiError::not_found("campaign"))?;

        if matches!(
            campaign.status,
            CampaignStatus::Completed | CampaignStatus::Archived
        ) {
            return Err(ApiError::Conflict(
                "CAMPAIGN_CLOSED",
                format!("campaign is {}", campaign.status.as_str()),
            ));
        }
        match (sequence_id, campaign.sequence_id) {
            (Some(a), Some(b)) if a != b => {
                return Err(ApiError::validation(
                    "sequence_id does not match the campaign's sequence",
                ));
            }
            (None, from_campaign) => sequence_id = from_campaign,
            _ => {}
        }
    }

    if let Some(sid) = sequence_id {
        ensure_sequence_open(db, sid).await?;
    }

    let first_due = plan::enrollment_due(db, sequence_id, now).await?;
    Ok(Enrollment {
        sequence_id,
        campaign_id,
        enrolled_at: now,
        first_due,
    })
}

fn not_eligible(status: LeadStatus) -> ApiError {
    ApiError::Conflict(
        "NOT_ELIGIBLE",
        format!("a lead in status {status} cannot be enrolled"),
    )
}

/// Enrolls one lead; `Ok(None)` when its status does not accept automation.
pub(crate) async fn apply_enrollment(
    db: &PgPool,
    lead_id: Uuid,
    enrollment: &Enrollment,
) -> Result<Option<LeadRow>, ApiError> {
    sqlx::query_as::<_, LeadRow>(&format!(
        r#"
        UPDATE lead
        SET sequence_id = $2,
            campaign_id = $3,
            sequence_day = 0,
            enrolled_at = $4,
            next_due_at = $5,
            updated_at = now()
        WHERE lead_id = $1
          AND status IN ('new', 'contacted', 'warm', 'cold', 'no_response')
        RETURNING {LEAD_COLUMNS}
        "#
    ))
    .bind(lead_id)
    .bind(enrollment.sequence_id)
    .bind(enrollment.campaign_id)
    .bind(enrollment.enrolled_at)
    .bind(enrollment.first_due)
    .fetch_optional(db)
    .await
    .map_err(db_error)
}

/// Schedule fields after a manual status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Schedule {
    pub sequence_day: i32,
    pub next_due_at: Option<DateTime<Utc>>,
    pub enrolled_at: Option<DateTime<Utc>>,
}

/// A lead moved into an eligible status resumes at its current day, due
/// `delay` after its last send (never earlier than now). `restart` puts it
/// back on day 0. Any other status halts the schedule but keeps the
/// enrollment so a later move back can resume.
pub(crate) fn reschedule(
    lead: &LeadRow,
    target: LeadStatus,
    restart: bool,
    plan: Option<&SequencePlan>,
    now: DateTime<Utc>,
) -> Schedule {
    let halted = Schedule {
        sequence_day: lead.sequence_day,
        next_due_at: None,
        enrolled_at: lead.enrolled_at,
    };
    if !target.accepts_automation() {
        return halted;
    }
    let Some(plan) = plan else {
        return halted;
    };
    if restart {
        return Schedule {
            sequence_day: 0,
            next_due_at: plan.due_after(0, now),
            enrolled_at: Some(now),
        };
    }
    let Some(enrolled_at) = lead.enrolled_at else {
        return halted;
    };
    if lead.next_due_at.is_some() {
        return Schedule {
            next_due_at: lead.next_due_at,
            ..halted
        };
    }
    let reference = lead.last_sent_at.unwrap_or(enrolled_at);
    Schedule {
        sequence_day: lead.sequence_day,
        next_due_at: plan
            .due_after(lead.sequence_day, reference)
            .map(|due| due.max(now)),
        enrolled_at: Some(enrolled_at),
    }
}

/* -------------------------
   GET /leads
--------------------------*/

#[derive(Debug, Deserialize)]
pub struct ListLeadsQuery {
    pub status: Option<String>,
    pub clinic_id: Option<Uuid>,
    pub campaign_id: Option<Uuid>,
    pub q: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn list_leads(
    State(state): State<AppState>,
    _op: OperatorContext,
    Query(q): Query<ListLeadsQuery>,
) -> Result<Json<ApiOk<Vec<LeadRow>>>, ApiError> {
    let status = clean_opt(q.status)
        .map(|s| parse_field::<LeadStatus>(&s))
        .transpose()?;
    let like = clean_opt(q.q).map(|s| format!("%{s}%"));
    let (limit, offset) = page(q.limit, q.offset);

    let rows = sqlx::query_as::<_, LeadRow>(&format!(
        r#"
        SELECT {LEAD_COLUMNS}
        FROM lead
        WHERE ($1::text IS NULL OR status = $1)
          AND ($2::uuid IS NULL OR clinic_id = $2)
          AND ($3::uuid IS NULL OR campaign_id = $3)
          AND ($4::text IS NULL OR name ILIKE $4 OR email ILIKE $4 OR phone ILIKE $4)
        ORDER BY created_at DESC
        LIMIT $5 OFFSET $6
        "#
    ))
    .bind(status)
    .bind(q.clinic_id)
    .bind(q.campaign_id)
    .bind(like)
    .bind(limit)
    .bind(offset)
    .fetch_all(&state.db)
    .await
    .map_err(db_error)?;

    Ok(Json(ApiOk { data: rows }))
}

pub async fn get_lead(
    State(state): State<AppState>,
    _op: OperatorContext,
    Path(lead_id): Path<Uuid>,
) -> Result<Json<ApiOk<LeadRow>>, ApiError> {
    Ok(Json(ApiOk {
        data: fetch_lead(&state.db, lead_id).await?,
    }))
}

/* -------------------------
   POST /leads
--------------------------*/

#[derive(Debug, Deserialize)]
pub struct CreateLeadRequest {
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub status: Option<String>,
    pub source: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub clinic_id: Option<Uuid>,
    pub marketing_opt_in: Option<bool>,
    pub notes: Option<String>,
    #[serde(default)]
    pub enroll: bool,
    pub sequence_id: Option<Uuid>,
    pub campaign_id: Option<Uuid>,
}

pub async fn create_lead(
    State(state): State<AppState>,
    _op: OperatorContext,
    Json(req): Json<CreateLeadRequest>,
) -> Result<Json<ApiOk<LeadRow>>, ApiError> {
    let name = required_text(&req.name, "name", 200)?;
    let email = checked_email(req.email)?;
    let phone = checked_phone(req.phone)?;
    if email.is_none() && phone.is_none() {
        return Err(ApiError::validation("email or phone is required"));
    }
    let status = match clean_opt(req.status) {
        Some(s) => parse_field::<LeadStatus>(&s)?,
        None => LeadStatus::New,
    };
    let source = match clean_opt(req.source) {
        Some(s) => parse_field::<LeadSource>(&s)?,
        None => LeadSource::Manual,
    };

    let now = Utc::now();
    let enrollment = if req.enroll {
        if !status.accepts_automation() {
            return Err(not_eligible(status));
        }
        Some(resolve_enrollment(&state.db, req.sequence_id, req.campaign_id, now).await?)
    } else {
        None
    };

    let row = sqlx::query_as::<_, LeadRow>(&format!(
        r#"
        INSERT INTO lead (
          name, email, phone, status, source, city, state, country, clinic_id,
          marketing_opt_in, notes, sequence_id, campaign_id, enrolled_at, next_due_at
        )
        VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15)
        RETURNING {LEAD_COLUMNS}
        "#
    ))
    .bind(&name)
    .bind(email)
    .bind(phone)
    .bind(status)
    .bind(source)
    .bind(clean_opt(req.city))
    .bind(clean_opt(req.state))
    .bind(clean_opt(req.country))
    .bind(req.clinic_id)
    .bind(req.marketing_opt_in.unwrap_or(false))
    .bind(clean_opt(req.notes))
    .bind(enrollment.as_ref().and_then(|e| e.sequence_id))
    .bind(enrollment.as_ref().and_then(|e| e.campaign_id))
    .bind(enrollment.as_ref().map(|e| e.enrolled_at))
    .bind(enrollment.as_ref().map(|e| e.first_due))
    .fetch_one(&state.db)
    .await
    .map_err(db_error)?;

    tracing::info!(lead_id = %row.lead_id, source = row.source.as_str(), enrolled = enrollment.is_some(), "lead created");
    Ok(Json(ApiOk { data: row }))
}

/* -------------------------
   PATCH /leads/{id}
--------------------------*/

#[derive(Debug, Deserialize)]
pub struct UpdateLeadRequest {
    pub name: Option<String>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub email: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub phone: Option<Option<String>>,
    pub source: Option<String>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub city: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub state: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub country: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub clinic_id: Option<Option<Uuid>>,
    pub marketing_opt_in: Option<bool>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub notes: Option<Option<String>>,
}

/// Contact and profile fields only; status has its own endpoint.
pub async fn update_lead(
    State(state): State<AppState>,
    _op: OperatorContext,
    Path(lead_id): Path<Uuid>,
    Json(req): Json<UpdateLeadRequest>,
) -> Result<Json<ApiOk<LeadRow>>, ApiError> {
    let existing = fetch_lead(&state.db, lead_id).await?;

    let name = match req.name.as_deref() {
        Some(n) => required_text(n, "name", 200)?,
        None => existing.name,
    };
    let email = match req.email {
        None => existing.email,
        Some(v) => checked_email(v)?,
    };
    let phone = match req.phone {
        None => existing.phone,
        Some(v) => checked_phone(v)?,
    };
    if email.is_none() && phone.is_none() {
        return Err(ApiError::validation("a lead needs an email or a phone"));
    }
    let source = match req.source.as_deref() {
        Some(s) => parse_field::<LeadSource>(s)?,
        None => existing.source,
    };
    let text = |patch: Option<Option<String>>, old: Option<String>| match patch {
        None => old,
        Some(v) => clean_opt(v),
    };
    let city = text(req.city, existing.city);
    let region = text(req.state, existing.state);
    let country = text(req.country, existing.country);
    let notes = text(req.notes, existing.notes);
    let clinic_id = match req.clinic_id {
        None => existing.clinic_id,
        Some(v) => v,
    };
    if existing.status == LeadStatus::Unsubscribed && req.marketing_opt_in == Some(true) {
        return Err(ApiError::Conflict(
            "UNSUBSCRIBED",
            "lead unsubscribed; change its status before opting in again".into(),
        ));
    }
    let marketing_opt_in = req.marketing_opt_in.unwrap_or(existing.marketing_opt_in);

    let row = sqlx::query_as::<_, LeadRow>(&format!(
        r#"
        UPDATE lead
        SET name = $2, email = $3, phone = $4, source = $5, city = $6, state = $7,
            country = $8, clinic_id = $9, marketing_opt_in = $10, notes = $11,
            updated_at = now()
        WHERE lead_id = $1
        RETURNING {LEAD_COLUMNS}
        "#
    ))
    .bind(lead_id)
    .bind(name)
    .bind(email)
    .bind(phone)
    .bind(source)
    .bind(city)
    .bind(region)
    .bind(country)
    .bind(clinic_id)
    .bind(marketing_opt_in)
    .bind(notes)
    .fetch_optional(&state.db)
    .await
    .map_err(db_error)?
    .ok_or_else(|| ApiError::not_found("lead"))?;

    Ok(Json(ApiOk { data: row }))
}

/* -------------------------
   PATCH /leads/{id}/status
--------------------------*/

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: String,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub restart_sequence: bool,
}

#[derive(Debug, Serialize)]
pub struct StatusChangeData {
    pub lead: LeadRow,
    pub transition: Transition,
}

pub async fn update_lead_status(
    State(state): State<AppState>,
    op: OperatorContext,
    Path(lead_id): Path<Uuid>,
    Json(req): Json<UpdateStatusRequest>,
) -> Result<Json<ApiOk<StatusChangeData>>, ApiError> {
    let target = parse_field::<LeadStatus>(&req.status)?;
    let lead = fetch_lead(&state.db, lead_id).await?;

    let transition = LeadStatus::classify(lead.status, target);
    if transition.needs_force() && !req.force {
        return Err(ApiError::Conflict(
            "INVALID_TRANSITION",
            format!(
                "moving a lead from {} to {target} is a {transition:?} move; pass \"force\": true",
                lead.status
            ),
        ));
    }

    let now = Utc::now();
    let plan = if target.accepts_automation() && (lead.enrolled_at.is_some() || req.restart_sequence) {
        Some(plan::load_plan(&state.db, lead.sequence_id).await?)
    } else {
        None
    };
    let schedule = reschedule(&lead, target, req.restart_sequence, plan.as_ref(), now);

    let row = sqlx::query_as::<_, LeadRow>(&format!(
        r#"
        UPDATE lead
        SET status = $2,
            sequence_day = $3,
            next_due_at = $4,
            enrolled_at = $5,
            contacted_at = CASE WHEN $2 <> 'new' THEN COALESCE(contacted_at, $6) ELSE contacted_at END,
            marketing_opt_in = CASE WHEN $2 = 'unsubscribed' THEN FALSE ELSE marketing_opt_in END,
            updated_at = now()
        WHERE lead_id = $1
        RETURNING {LEAD_COLUMNS}
        "#
    ))
    .bind(lead_id)
    .bind(target)
    .bind(schedule.sequence_day)
    .bind(schedule.next_due_at)
    .bind(schedule.enrolled_at)
    .bind(now)
    .fetch_optional(&state.db)
    .await
    .map_err(db_error)?
    .ok_or_else(|| ApiError::not_found("lead"))?;

    tracing::info!(
        %lead_id,
        from = %lead.status,
        to = %target,
        transition = ?transition,
        forced = req.force,
        operator = %op.token_fingerprint,
        "lead status changed"
    );

    Ok(Json(ApiOk {
        data: StatusChangeData {
            lead: row,
            transition,
        },
    }))
}

/* -------------------------
   Enrollment
--------------------------*/

#[derive(Debug, Default, Deserialize)]
pub struct EnrollRequest {
    pub sequence_id: Option<Uuid>,
    pub campaign_id: Option<Uuid>,
}

pub async fn enroll_lead(
    State(state): State<AppState>,
    _op: OperatorContext,
    Path(lead_id): Path<Uuid>,
    body: Option<Json<EnrollRequest>>,
) -> Result<Json<ApiOk<LeadRow>>, ApiError> {
    let req = body.map(|Json(b)| b).unwrap_or_default();
    let lead = fetch_lead(&state.db, lead_id).await?;
    if !lead.status.accepts_automation() {
        return Err(not_eligible(lead.status));
    }

    let enrollment = resolve_enrollment(&state.db, req.sequence_id, req.campaign_id, Utc::now()).await?;
    let row = apply_enrollment(&state.db, lead_id, &enrollment)
        .await?
        .ok_or_else(|| not_eligible(lead.status))?;

    tracing::info!(%lead_id, sequence_id = ?row.sequence_id, campaign_id = ?row.campaign_id, "lead enrolled");
    Ok(Json(ApiOk { data: row }))
}

pub async fn unenroll_lead(
    State(state): State<AppState>,
    _op: OperatorContext,
    Path(lead_id): Path<Uuid>,
) -> Result<Json<ApiOk<LeadRow>>, ApiError> {
    let row = sqlx::query_as::<_, LeadRow>(&format!(
        r#"
        UPDATE lead
        SET next_due_at = NULL, enrolled_at = NULL, updated_at = now()
        WHERE lead_id = $1
        RETURNING {LEAD_COLUMNS}
        "#
    ))
    .bind(lead_id)
    .fetch_optional(&state.db)
    .await
    .map_err(db_error)?
    .ok_or_else(|| ApiError::not_found("lead"))?;

    tracing::info!(%lead_id, "lead unenrolled");
    Ok(Json(ApiOk { data: row }))
}

pub async fn list_lead_messages(
    State(state): State<AppState>,
    _op: OperatorContext,
    Path(lead_id): Path<Uuid>,
) -> Result<Json<ApiOk<Vec<MessageLogRow>>>, ApiError> {
    fetch_lead(&state.db, lead_id).await?;

    let rows = sqlx::query_as::<_, MessageLogRow>(
        r#"
        SELECT message_id, lead_id, campaign_id, channel, template_key, sequence_day,
               outcome, provider_message_id, error, cost_cents, created_at
        FROM message_log
        WHERE lead_id = $1
        ORDER BY created_at DESC
        LIMIT 200
        "#,
    )
    .bind(lead_id)
    .fetch_all(&state.db)
    .await
    .map_err(db_error)?;

    Ok(Json(ApiOk { data: rows }))
}

/* -------------------------
   POST /leads/import
--------------------------*/

#[derive(Debug, Deserialize)]
pub struct ImportQuery {
    pub clinic_id: Option<Uuid>,
    pub sequence_id: Option<Uuid>,
    #[serde(default)]
    pub enroll: bool,
    #[serde(default)]
    pub dry_run: bool,
}

pub async fn import_leads_csv(
    State(state): State<AppState>,
    op: OperatorContext,
    Query(q): Query<ImportQuery>,
    body: String,
) -> Result<Json<ApiOk<ImportReport>>, ApiError> {
    let opts = ImportOptions {
        clinic_id: q.clinic_id,
        sequence_id: q.sequence_id,
        enroll: q.enroll,
        dry_run: q.dry_run,
    };
    tracing::debug!(operator = %op.token_fingerprint, bytes = body.len(), "csv import requested");
    let report = import::import_leads(&state.db, body.as_bytes(), &opts, Utc::now()).await?;
    Ok(Json(ApiOk { data: report }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::memory::MemoryStore;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_sequence_gate_rejects_missing_and_inactive() {
        assert!(sequence_gate(Some(true)).is_ok());
        assert!(matches!(sequence_gate(None), Err(ApiError::NotFound(..))));
        assert!(matches!(
            sequence_gate(Some(false)),
            Err(ApiError::Conflict("SEQUENCE_INACTIVE", _))
        ));
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, 10, 0, 0).unwrap()
    }

    fn won_mid_sequence() -> LeadRow {
        let mut lead = MemoryStore::lead("Ana", t0());
        lead.status = LeadStatus::Won;
        lead.sequence_day = 2;
        lead.last_sent_at = Some(t0() + Duration::days(2));
        lead.next_due_at = None;
        lead
    }

    #[test]
    fn test_moving_back_resumes_current_day() {
        let lead = won_mid_sequence();
        let plan = SequencePlan::genius();
        // day 2 (sms) waits two days after the last send
        let now = t0() + Duration::days(3);
        let s = reschedule(&lead, LeadStatus::Contacted, false, Some(&plan), now);
        assert_eq!(s.sequence_day, 2);
        assert_eq!(s.next_due_at, Some(t0() + Duration::days(4)));

        let later = t0() + Duration::days(10);
        let s = reschedule(&lead, LeadStatus::Contacted, false, Some(&plan), later);
        assert_eq!(s.next_due_at, Some(later));
    }

    #[test]
    fn test_restart_goes_back_to_day_zero() {
        let lead = won_mid_sequence();
        let plan = SequencePlan::genius();
        let now = t0() + Duration::days(3);
        let s = reschedule(&lead, LeadStatus::New, true, Some(&plan), now);
        assert_eq!(s.sequence_day, 0);
        assert_eq!(s.next_due_at, Some(now));
        assert_eq!(s.enrolled_at, Some(now));
    }

    #[test]
    fn test_non_eligible_target_halts_but_keeps_enrollment() {
        let mut lead = MemoryStore::lead("Ana", t0());
        lead.sequence_day = 1;
        let s = reschedule(&lead, LeadStatus::DemoBooked, false, None, t0());
        assert_eq!(s.next_due_at, None);
        assert_eq!(s.sequence_day, 1);
        assert_eq!(s.enrolled_at, lead.enrolled_at);
    }

    #[test]
    fn test_never_enrolled_lead_stays_unscheduled() {
        let mut lead = MemoryStore::lead("Ana", t0());
        lead.enrolled_at = None;
        lead.next_due_at = None;
        let plan = SequencePlan::genius();
        let s = reschedule(&lead, LeadStatus::Warm, false, Some(&plan), t0());
        assert_eq!(s.next_due_at, None);
    }

    #[test]
    fn test_finished_sequence_is_not_resumed() {
        let mut lead = won_mid_sequence();
        lead.sequence_day = 7;
        let plan = SequencePlan::genius();
        let s = reschedule(&lead, LeadStatus::Cold, false, Some(&plan), t0());
        assert_eq!(s.next_due_at, None);
    }

    #[test]
    fn test_lateral_move_keeps_pending_schedule() {
        let lead = MemoryStore::lead("Ana", t0());
        let plan = SequencePlan::genius();
        let s = reschedule(&lead, LeadStatus::New, false, Some(&plan), t0() + Duration::hours(1));
        assert_eq!(s.next_due_at, Some(t0()));
    }
}
