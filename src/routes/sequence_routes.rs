// src/routes/sequence_routes.rs
//
// Custom drip sequences. Leads without a sequence follow the built-in plan.

use axum::{
    extract::{Path, State},
    routing::{get, patch},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{db_error, ApiError},
    middleware::auth_context::OperatorContext,
    models::{clean_opt, ok, ApiOk, AppState, Channel, OkData, SequenceRow, SequenceStepRow},
    templates::TemplateId,
};

use super::{deserialize_double_option, required_text};

const SEQUENCE_COLUMNS: &str = "sequence_id, name, description, is_active, created_at, updated_at";
const STEP_COLUMNS: &str = "step_id, sequence_id, step_order, channel, delay_days, delay_hours, \
     subject, body, template_id, created_at";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/sequences", get(list_sequences).post(create_sequence))
        .route(
            "/sequences/{sequence_id}",
            get(get_sequence).patch(update_sequence).delete(delete_sequence),
        )
        .route(
            "/sequences/{sequence_id}/steps",
            get(list_steps).post(create_step),
        )
        .route(
            "/sequence_steps/{step_id}",
            patch(update_step).delete(delete_step),
        )
}

/// Content rules for one step: exactly one of `body`/`template_id`, catalog
/// templates only on their native channel, custom email needs a subject.
fn validate_step(
    channel: Channel,
    subject: Option<&str>,
    body: Option<&str>,
    template_id: Option<&str>,
    delay_days: i32,
    delay_hours: i32,
) -> Result<(), String> {
    if delay_days < 0 || delay_hours < 0 {
        return Err("delays cannot be negative".into());
    }
    if delay_days > 365 || delay_hours > 24 * 365 {
        return Err("delay is longer than a year".into());
    }
    match (body, template_id) {
        (Some(_), Some(_)) => Err("set either body or template_id, not both".into()),
        (None, None) => Err("body or template_id is required".into()),
        (None, Some(tid)) => {
            let id = tid.parse::<TemplateId>().map_err(|e| e.to_string())?;
            if id.fits_channel(channel) {
                Ok(())
            } else {
                Err(format!("template {id} cannot be sent over {channel}"))
            }
        }
        (Some(_), None) if channel == Channel::Email && subject.is_none() => {
            Err("email steps with a custom body need a subject".into())
        }
        (Some(_), None) => Ok(()),
    }
}

async fn fetch_sequence(state: &AppState, sequence_id: Uuid) -> Result<SequenceRow, ApiError> {
    sqlx::query_as::<_, SequenceRow>(&format!(
        "SELECT {SEQUENCE_COLUMNS} FROM sequence WHERE sequence_id = $1"
    ))
    .bind(sequence_id)
    .fetch_optional(&state.db)
    .await
    .map_err(db_error)?
    .ok_or_else(|| ApiError::not_found("sequence"))
}

async fn fetch_steps(state: &AppState, sequence_id: Uuid) -> Result<Vec<SequenceStepRow>, ApiError> {
    sqlx::query_as::<_, SequenceStepRow>(&format!(
        "SELECT {STEP_COLUMNS} FROM sequence_step WHERE sequence_id = $1 ORDER BY step_order ASC"
    ))
    .bind(sequence_id)
    .fetch_all(&state.db)
    .await
    .map_err(db_error)
}

#[derive(Debug, Serialize)]
pub struct SequenceDetail {
    #[serde(flatten)]
    pub sequence: SequenceRow,
    pub steps: Vec<SequenceStepRow>,
}

pub async fn list_sequences(
    State(state): State<AppState>,
    _op: OperatorContext,
) -> Result<Json<ApiOk<Vec<SequenceRow>>>, ApiError> {
    let rows = sqlx::query_as::<_, SequenceRow>(&format!(
        "SELECT {SEQUENCE_COLUMNS} FROM sequence ORDER BY created_at DESC"
    ))
    .fetch_all(&state.db)
    .await
    .map_err(db_error)?;

    Ok(Json(ApiOk { data: rows }))
}

pub async fn get_sequence(
    State(state): State<AppState>,
    _op: OperatorContext,
    Path(sequence_id): Path<Uuid>,
) -> Result<Json<ApiOk<SequenceDetail>>, ApiError> {
    let sequence = fetch_sequence(&state, sequence_id).await?;
    let steps = fetch_steps(&state, sequence_id).await?;
    Ok(Json(ApiOk {
        data: SequenceDetail { sequence, steps },
    }))
}

#[derive(Debug, Deserialize)]
pub struct CreateSequenceRequest {
    pub name: String,
    pub description: Option<String>,
    pub is_active: Option<bool>,
}

pub async fn create_sequence(
    State(state): State<AppState>,
    _op: OperatorContext,
    Json(req): Json<CreateSequenceRequest>,
) -> Result<Json<ApiOk<SequenceRow>>, ApiError> {
    let name = required_text(&req.name, "name", 128)?;

    let row = sqlx::query_as::<_, SequenceRow>(&format!(
        r#"
        INSERT INTO sequence (name, description, is_active)
        VALUES ($1, $2, $3)
        RETURNING {SEQUENCE_COLUMNS}
        "#
    ))
    .bind(name)
    .bind(clean_opt(req.description))
    .bind(req.is_active.unwrap_or(true))
    .fetch_one(&state.db)
    .await
    .map_err(db_error)?;

    Ok(Json(ApiOk { data: row }))
}

#[derive(Debug, Deserialize)]
pub struct UpdateSequenceRequest {
    pub name: Option<String>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub description: Option<Option<String>>,
    pub is_active: Option<bool>,
}

/// Deactivating blocks new enrollments and holds enrolled leads at their
/// current step until the sequence is active again.
pub async fn update_sequence(
    State(state): State<AppState>,
    _op: OperatorContext,
    Path(sequence_id): Path<Uuid>,
    Json(req): Json<UpdateSequenceRequest>,
) -> Result<Json<ApiOk<SequenceRow>>, ApiError> {
    let existing = fetch_sequence(&state, sequence_id).await?;

    let name = match req.name.as_deref() {
        Some(n) => required_text(n, "name", 128)?,
        None => existing.name,
    };
    let description = match req.description {
        None => existing.description,
        Some(v) => clean_opt(v),
    };

    let row = sqlx::query_as::<_, SequenceRow>(&format!(
        r#"
        UPDATE sequence
        SET name = $2, description = $3, is_active = $4, updated_at = now()
        WHERE sequence_id = $1
        RETURNING {SEQUENCE_COLUMNS}
        "#
    ))
    .bind(sequence_id)
    .bind(name)
    .bind(description)
    .bind(req.is_active.unwrap_or(existing.is_active))
    .fetch_one(&state.db)
    .await
    .map_err(db_error)?;

    Ok(Json(ApiOk { data: row }))
}

pub async fn delete_sequence(
    State(state): State<AppState>,
    _op: OperatorContext,
    Path(sequence_id): Path<Uuid>,
) -> Result<Json<ApiOk<OkData>>, ApiError> {
    let deleted = sqlx::query("DELETE FROM sequence WHERE sequence_id = $1")
        .bind(sequence_id)
        .execute(&state.db)
        .await
        .map_err(db_error)?
        .rows_affected();

    if deleted == 0 {
        return Err(ApiError::not_found("sequence"));
    }
    Ok(Json(ok()))
}

/* -------------------------
   Steps
--------------------------*/

pub async fn list_steps(
    State(state): State<AppState>,
    _op: OperatorContext,
    Path(sequence_id): Path<Uuid>,
) -> Result<Json<ApiOk<Vec<SequenceStepRow>>>, ApiError> {
    fetch_sequence(&state, sequence_id).await?;
    Ok(Json(ApiOk {
        data: fetch_steps(&state, sequence_id).await?,
    }))
}

#[derive(Debug, Deserialize)]
pub struct CreateStepRequest {
    pub step_order: Option<i32>,
    pub channel: Channel,
    pub delay_days: Option<i32>,
    pub delay_hours: Option<i32>,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub template_id: Option<String>,
}

pub async fn create_step(
    State(state): State<AppState>,
    _op: OperatorContext,
    Path(sequence_id): Path<Uuid>,
    Json(req): Json<CreateStepRequest>,
) -> Result<Json<ApiOk<SequenceStepRow>>, ApiError> {
    fetch_sequence(&state, sequence_id).await?;

    let subject = clean_opt(req.subject);
    let body = clean_opt(req.body);
    let template_id = clean_opt(req.template_id).map(|t| t.to_ascii_lowercase().replace('-', "_"));
    let delay_days = req.delay_days.unwrap_or(0);
    let delay_hours = req.delay_hours.unwrap_or(0);
    validate_step(
        req.channel,
        subject.as_deref(),
        body.as_deref(),
        template_id.as_deref(),
        delay_days,
        delay_hours,
    )
    .map_err(ApiError::validation)?;

    let step_order = match req.step_order {
        Some(o) if o < 0 => return Err(ApiError::validation("step_order cannot be negative")),
        Some(o) => o,
        None => {
            let max: Option<i32> = sqlx::query_scalar(
                "SELECT MAX(step_order) FROM sequence_step WHERE sequence_id = $1",
            )
            .bind(sequence_id)
            .fetch_one(&state.db)
            .await
            .map_err(db_error)?;
            max.map_or(0, |m| m + 1)
        }
    };

    let row = sqlx::query_as::<_, SequenceStepRow>(&format!(
        r#"
        INSERT INTO sequence_step (
          sequence_id, step_order, channel, delay_days, delay_hours, subject, body, template_id
        )
        VALUES ($1,$2,$3,$4,$5,$6,$7,$8)
        RETURNING {STEP_COLUMNS}
        "#
    ))
    .bind(sequence_id)
    .bind(step_order)
    .bind(req.channel)
    .bind(delay_days)
    .bind(delay_hours)
    .bind(subject)
    .bind(body)
    .bind(template_id)
    .fetch_one(&state.db)
    .await
    .map_err(|e| match db_error(e) {
        ApiError::Conflict("DUPLICATE", _) => ApiError::Conflict(
            "STEP_ORDER_TAKEN",
            format!("step_order {step_order} already exists in this sequence"),
        ),
        other => other,
    })?;

    Ok(Json(ApiOk { data: row }))
}

#[derive(Debug, Deserialize)]
pub struct UpdateStepRequest {
    pub step_order: Option<i32>,
    pub channel: Option<Channel>,
    pub delay_days: Option<i32>,
    pub delay_hours: Option<i32>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub subject: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub body: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub template_id: Option<Option<String>>,
}

pub async fn update_step(
    State(state): State<AppState>,
    _op: OperatorContext,
    Path(step_id): Path<Uuid>,
    Json(req): Json<UpdateStepRequest>,
) -> Result<Json<ApiOk<SequenceStepRow>>, ApiError> {
    let existing = sqlx::query_as::<_, SequenceStepRow>(&format!(
        "SELECT {STEP_COLUMNS} FROM sequence_step WHERE step_id = $1"
    ))
    .bind(step_id)
    .fetch_optional(&state.db)
    .await
    .map_err(db_error)?
    .ok_or_else(|| ApiError::not_found("sequence step"))?;

    let channel = req.channel.unwrap_or(existing.channel);
    let step_order = req.step_order.unwrap_or(existing.step_order);
    if step_order < 0 {
        return Err(ApiError::validation("step_order cannot be negative"));
    }
    let delay_days = req.delay_days.unwrap_or(existing.delay_days);
    let delay_hours = req.delay_hours.unwrap_or(existing.delay_hours);
    let subject = match req.subject {
        None => existing.subject,
        Some(v) => clean_opt(v),
    };
    let body = match req.body {
        None => existing.body,
        Some(v) => clean_opt(v),
    };
    let template_id = match req.template_id {
        None => existing.template_id,
        Some(v) => clean_opt(v).map(|t| t.to_ascii_lowercase().replace('-', "_")),
    };
    validate_step(
        channel,
        subject.as_deref(),
        body.as_deref(),
        template_id.as_deref(),
        delay_days,
        delay_hours,
    )
    .map_err(ApiError::validation)?;

    let row = sqlx::query_as::<_, SequenceStepRow>(&format!(
        r#"
        UPDATE sequence_step
        SET step_order = $2, channel = $3, delay_days = $4, delay_hours = $5,
            subject = $6, body = $7, template_id = $8
        WHERE step_id = $1
        RETURNING {STEP_COLUMNS}
        "#
    ))
    .bind(step_id)
    .bind(step_order)
    .bind(channel)
    .bind(delay_days)
    .bind(delay_hours)
    .bind(subject)
    .bind(body)
    .bind(template_id)
    .fetch_one(&state.db)
    .await
    .map_err(db_error)?;

    Ok(Json(ApiOk { data: row }))
}

pub async fn delete_step(
    State(state): State<AppState>,
    _op: OperatorContext,
    Path(step_id): Path<Uuid>,
) -> Result<Json<ApiOk<OkData>>, ApiError> {
    let deleted = sqlx::query("DELETE FROM sequence_step WHERE step_id = $1")
        .bind(step_id)
        .execute(&state.db)
        .await
        .map_err(db_error)?
        .rows_affected();

    if deleted == 0 {
        return Err(ApiError::not_found("sequence step"));
    }
    Ok(Json(ok()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_content_rules() {
        assert!(validate_step(Channel::Email, None, None, Some("roi_story"), 2, 0).is_ok());
        assert!(validate_step(Channel::Sms, None, Some("Hi {first_name}"), None, 0, 4).is_ok());
        assert!(validate_step(Channel::Email, Some("Hello"), Some("Body"), None, 1, 0).is_ok());

        assert!(validate_step(Channel::Email, None, Some("Body"), None, 1, 0).is_err());
        assert!(validate_step(Channel::Sms, None, Some("x"), Some("quick_check_in"), 0, 0).is_err());
        assert!(validate_step(Channel::Sms, None, None, None, 0, 0).is_err());
        assert!(validate_step(Channel::Whatsapp, None, None, Some("case_study"), 0, 0).is_err());
        assert!(validate_step(Channel::Email, None, None, Some("newsletter"), 0, 0).is_err());
        assert!(validate_step(Channel::Sms, None, Some("x"), None, -1, 0).is_err());
    }
}
