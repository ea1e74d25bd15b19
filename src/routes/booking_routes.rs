// src/routes/booking_routes.rs
//
// Patient booking requests for a clinic. The public booking form posts
// through `public_routes`; staff manage them here.

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use chrono::{NaiveDate, NaiveTime};
use serde::Deserialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    error::{db_error, ApiError},
    lifecycle::BookingStatus,
    middleware::auth_context::OperatorContext,
    models::{clean_opt, is_plausible_email, normalize_phone, ApiOk, AppState, BookingRow},
};

use super::{clinic_routes::fetch_clinic, deserialize_double_option, page, parse_field, required_text};

pub(crate) const BOOKING_COLUMNS: &str = "booking_id, clinic_id, patient_name, patient_email, \
     patient_phone, status, preferred_date, preferred_time, notes, created_at, updated_at";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/bookings", get(list_bookings).post(create_booking))
        .route("/bookings/{booking_id}", get(get_booking).patch(update_booking))
        .route("/bookings/{booking_id}/status", post(set_booking_status))
}

/// Booking form input shared by the staff and public endpoints.
#[derive(Debug, Deserialize)]
pub struct BookingInput {
    pub patient_name: String,
    pub patient_email: Option<String>,
    pub patient_phone: Option<String>,
    pub preferred_date: Option<NaiveDate>,
    pub preferred_time: Option<NaiveTime>,
    pub notes: Option<String>,
}

/// Validated booking fields, ready to insert.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CleanBooking {
    pub patient_name: String,
    pub patient_email: Option<String>,
    pub patient_phone: Option<String>,
    pub preferred_date: Option<NaiveDate>,
    pub preferred_time: Option<NaiveTime>,
    pub notes: Option<String>,
}

pub(crate) fn clean_booking(input: BookingInput) -> Result<CleanBooking, ApiError> {
    let patient_name = required_text(&input.patient_name, "patient_name", 128)?;
    let patient_email = clean_opt(input.patient_email)
        .map(|e| e.to_ascii_lowercase())
        .map(|e| {
            if is_plausible_email(&e) {
                Ok(e)
            } else {
                Err(ApiError::validation("patient_email is invalid"))
            }
        })
        .transpose()?;
    let patient_phone = clean_opt(input.patient_phone)
        .map(|p| normalize_phone(&p).ok_or_else(|| ApiError::validation("patient_phone is invalid")))
        .transpose()?;
    if patient_email.is_none() && patient_phone.is_none() {
        return Err(ApiError::validation(
            "patient_email or patient_phone is required",
        ));
    }
    let notes = clean_opt(input.notes);
    if notes.as_ref().is_some_and(|n| n.chars().count() > 2000) {
        return Err(ApiError::validation("notes is too long (max 2000)"));
    }

    Ok(CleanBooking {
        patient_name,
        patient_email,
        patient_phone,
        preferred_date: input.preferred_date,
        preferred_time: input.preferred_time,
        notes,
    })
}

pub(crate) async fn insert_booking<'e, E>(
    db: E,
    clinic_id: Uuid,
    booking: &CleanBooking,
) -> Result<BookingRow, ApiError>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query_as::<_, BookingRow>(&format!(
        r#"
        INSERT INTO patient_booking (
          clinic_id, patient_name, patient_email, patient_phone,
          status, preferred_date, preferred_time, notes
        )
        VALUES ($1,$2,$3,$4,$5,$6,$7,$8)
        RETURNING {BOOKING_COLUMNS}
        "#
    ))
    .bind(clinic_id)
    .bind(&booking.patient_name)
    .bind(&booking.patient_email)
    .bind(&booking.patient_phone)
    .bind(BookingStatus::Pending)
    .bind(booking.preferred_date)
    .bind(booking.preferred_time)
    .bind(&booking.notes)
    .fetch_one(db)
    .await
    .map_err(db_error)
}

async fn fetch_booking(db: &PgPool, booking_id: Uuid) -> Result<BookingRow, ApiError> {
    sqlx::query_as::<_, BookingRow>(&format!(
        "SELECT {BOOKING_COLUMNS} FROM patient_booking WHERE booking_id = $1"
    ))
    .bind(booking_id)
    .fetch_optional(db)
    .await
    .map_err(db_error)?
    .ok_or_else(|| ApiError::not_found("booking"))
}

#[derive(Debug, Deserialize)]
pub struct ListBookingsQuery {
    pub clinic_id: Option<Uuid>,
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn list_bookings(
    State(state): State<AppState>,
    _op: OperatorContext,
    Query(q): Query<ListBookingsQuery>,
) -> Result<Json<ApiOk<Vec<BookingRow>>>, ApiError> {
    let status = clean_opt(q.status)
        .map(|s| parse_field::<BookingStatus>(&s))
        .transpose()?;
    let (limit, offset) = page(q.limit, q.offset);

    let rows = sqlx::query_as::<_, BookingRow>(&format!(
        r#"
        SELECT {BOOKING_COLUMNS}
        FROM patient_booking
        WHERE ($1::uuid IS NULL OR clinic_id = $1)
          AND ($2::text IS NULL OR status = $2)
        ORDER BY created_at DESC
        LIMIT $3 OFFSET $4
        "#
    ))
    .bind(q.clinic_id)
    .bind(status)
    .bind(limit)
    .bind(offset)
    .fetch_all(&state.db)
    .await
    .map_err(db_error)?;

    Ok(Json(ApiOk { data: rows }))
}

pub async fn get_booking(
    State(state): State<AppState>,
    _op: OperatorContext,
    Path(booking_id): Path<Uuid>,
) -> Result<Json<ApiOk<BookingRow>>, ApiError> {
    Ok(Json(ApiOk {
        data: fetch_booking(&state.db, booking_id).await?,
    }))
}

#[derive(Debug, Deserialize)]
pub struct CreateBookingRequest {
    pub clinic_id: Uuid,
    #[serde(flatten)]
    pub booking: BookingInput,
}

pub async fn create_booking(
    State(state): State<AppState>,
    _op: OperatorContext,
    Json(req): Json<CreateBookingRequest>,
) -> Result<Json<ApiOk<BookingRow>>, ApiError> {
    let clinic = fetch_clinic(&state, req.clinic_id).await?;
    let booking = clean_booking(req.booking)?;
    let row = insert_booking(&state.db, clinic.clinic_id, &booking).await?;

    tracing::info!(booking_id = %row.booking_id, clinic_id = %row.clinic_id, "booking created");
    Ok(Json(ApiOk { data: row }))
}

#[derive(Debug, Deserialize)]
pub struct UpdateBookingRequest {
    pub patient_name: Option<String>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub patient_email: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub patient_phone: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub preferred_date: Option<Option<NaiveDate>>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub preferred_time: Option<Option<NaiveTime>>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub notes: Option<Option<String>>,
}

/// Edits details only; status moves go through `/status`.
pub async fn update_booking(
    State(state): State<AppState>,
    _op: OperatorContext,
    Path(booking_id): Path<Uuid>,
    Json(req): Json<UpdateBookingRequest>,
) -> Result<Json<ApiOk<BookingRow>>, ApiError> {
    let existing = fetch_booking(&state.db, booking_id).await?;

    let merged = clean_booking(BookingInput {
        patient_name: req.patient_name.unwrap_or(existing.patient_name),
        patient_email: req.patient_email.unwrap_or(existing.patient_email),
        patient_phone: req.patient_phone.unwrap_or(existing.patient_phone),
        preferred_date: req.preferred_date.unwrap_or(existing.preferred_date),
        preferred_time: req.preferred_time.unwrap_or(existing.preferred_time),
        notes: req.notes.unwrap_or(existing.notes),
    })?;

    let row = sqlx::query_as::<_, BookingRow>(&format!(
        r#"
        UPDATE patient_booking
        SET patient_name = $2,
            patient_email = $3,
            patient_phone = $4,
            preferred_date = $5,
            preferred_time = $6,
            notes = $7,
            updated_at = now()
        WHERE booking_id = $1
        RETURNING {BOOKING_COLUMNS}
        "#
    ))
    .bind(booking_id)
    .bind(merged.patient_name)
    .bind(merged.patient_email)
    .bind(merged.patient_phone)
    .bind(merged.preferred_date)
    .bind(merged.preferred_time)
    .bind(merged.notes)
    .fetch_one(&state.db)
    .await
    .map_err(db_error)?;

    Ok(Json(ApiOk { data: row }))
}

#[derive(Debug, Deserialize)]
pub struct BookingStatusRequest {
    pub status: String,
}

pub async fn set_booking_status(
    State(state): State<AppState>,
    _op: OperatorContext,
    Path(booking_id): Path<Uuid>,
    Json(req): Json<BookingStatusRequest>,
) -> Result<Json<ApiOk<BookingRow>>, ApiError> {
    let target = parse_field::<BookingStatus>(&req.status)?;
    let existing = fetch_booking(&state.db, booking_id).await?;

    if existing.status == target {
        return Ok(Json(ApiOk { data: existing }));
    }
    if !existing.status.can_transition_to(target) {
        return Err(ApiError::Conflict(
            "INVALID_TRANSITION",
            format!("booking cannot move from {} to {target}", existing.status),
        ));
    }

    let row = sqlx::query_as::<_, BookingRow>(&format!(
        r#"
        UPDATE patient_booking
        SET status = $3, updated_at = now()
        WHERE booking_id = $1 AND status = $2
        RETURNING {BOOKING_COLUMNS}
        "#
    ))
    .bind(booking_id)
    .bind(existing.status)
    .bind(target)
    .fetch_optional(&state.db)
    .await
    .map_err(db_error)?
    .ok_or_else(|| {
        ApiError::Conflict("INVALID_TRANSITION", "booking changed status; retry".into())
    })?;

    tracing::info!(%booking_id, from = %existing.status, to = %target, "booking status changed");
    Ok(Json(ApiOk { data: row }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> BookingInput {
        BookingInput {
            patient_name: "  Maria Silva ".into(),
            patient_email: Some(" Maria@Example.com ".into()),
            patient_phone: None,
            preferred_date: NaiveDate::from_ymd_opt(2026, 6, 1),
            preferred_time: NaiveTime::from_hms_opt(14, 30, 0),
            notes: Some("   ".into()),
        }
    }

    #[test]
    fn test_clean_booking_normalizes_fields() {
        let b = clean_booking(input()).unwrap();
        assert_eq!(b.patient_name, "Maria Silva");
        assert_eq!(b.patient_email.as_deref(), Some("maria@example.com"));
        assert_eq!(b.notes, None);
    }

    #[test]
    fn test_clean_booking_requires_a_contact() {
        let mut i = input();
        i.patient_email = None;
        assert!(clean_booking(i).is_err());

        let mut i = input();
        i.patient_email = Some("not-an-email".into());
        assert!(clean_booking(i).is_err());

        let mut i = input();
        i.patient_name = " ".into();
        assert!(clean_booking(i).is_err());
    }
}
