// src/routes/public_routes.rs
//
// Unauthenticated surface: clinic booking pages, chatbot lead capture and
// unsubscribe links. Responses expose ids only, never lead details.

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::{
    error::{db_error, ApiError},
    models::{clean_opt, is_plausible_email, normalize_phone, ApiOk, AppState, ClinicRow, LeadSource},
};

use super::{
    booking_routes::{clean_booking, insert_booking, BookingInput},
    clinic_routes::CLINIC_COLUMNS,
    required_text,
};

pub fn router() -> Router<AppState> {
    Router::new()
        // /api/v1/public
        .route("/clinics/{slug}", get(clinic_page))
        .route("/clinics/{slug}/bookings", post(request_booking))
        .route("/chatbot/leads", post(capture_chatbot_lead))
        .route("/unsubscribe/{lead_id}", get(unsubscribe))
}

async fn clinic_by_slug(state: &AppState, slug: &str) -> Result<ClinicRow, ApiError> {
    sqlx::query_as::<_, ClinicRow>(&format!(
        "SELECT {CLINIC_COLUMNS} FROM clinic WHERE slug = $1"
    ))
    .bind(slug.trim().to_ascii_lowercase())
    .fetch_optional(&state.db)
    .await
    .map_err(db_error)?
    .ok_or_else(|| ApiError::not_found("clinic"))
}

/// Contact details captured from a public form.
struct Contact<'a> {
    name: &'a str,
    email: Option<&'a str>,
    phone: Option<&'a str>,
    clinic_id: Option<Uuid>,
    source: LeadSource,
    marketing_opt_in: bool,
    notes: Option<&'a str>,
}

/// Links the contact to an existing lead (same email, else same phone) or
/// creates a new one. Public capture never enrolls and never downgrades an
/// existing lead's status or consent.
async fn link_or_create_lead(
    tx: &mut Transaction<'_, Postgres>,
    contact: &Contact<'_>,
) -> Result<(Uuid, bool), ApiError> {
    let existing: Option<Uuid> = sqlx::query_scalar(
        r#"
        SELECT lead_id
        FROM lead
        WHERE ($1::text IS NOT NULL AND lower(email) = $1)
           OR ($1::text IS NULL AND $2::text IS NOT NULL AND phone = $2)
        ORDER BY created_at ASC
        LIMIT 1
        "#,
    )
    .bind(contact.email)
    .bind(contact.phone)
    .fetch_optional(&mut **tx)
    .await
    .map_err(db_error)?;

    if let Some(lead_id) = existing {
        sqlx::query(
            r#"
            UPDATE lead
            SET phone = COALESCE(phone, $2),
                clinic_id = COALESCE(clinic_id, $3),
                marketing_opt_in = CASE
                    WHEN $4 AND status <> 'unsubscribed' THEN TRUE
                    ELSE marketing_opt_in
                END,
                updated_at = now()
            WHERE lead_id = $1
            "#,
        )
        .bind(lead_id)
        .bind(contact.phone)
        .bind(contact.clinic_id)
        .bind(contact.marketing_opt_in)
        .execute(&mut **tx)
        .await
        .map_err(db_error)?;
        return Ok((lead_id, false));
    }

    let lead_id: Uuid = sqlx::query_scalar(
        r#"
        INSERT INTO lead (name, email, phone, status, source, clinic_id, marketing_opt_in, notes)
        VALUES ($1, $2, $3, 'new', $4, $5, $6, $7)
        RETURNING lead_id
        "#,
    )
    .bind(contact.name)
    .bind(contact.email)
    .bind(contact.phone)
    .bind(contact.source)
    .bind(contact.clinic_id)
    .bind(contact.marketing_opt_in)
    .bind(contact.notes)
    .fetch_one(&mut **tx)
    .await
    .map_err(db_error)?;
    Ok((lead_id, true))
}

/* -------------------------
   GET /public/clinics/{slug}
--------------------------*/

#[derive(Debug, Serialize)]
pub struct ClinicPage {
    pub name: String,
    pub slug: String,
    pub brand_color: Option<String>,
    pub logo_url: Option<String>,
    pub booking_path: String,
}

pub async fn clinic_page(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Result<Json<ApiOk<ClinicPage>>, ApiError> {
    let clinic = clinic_by_slug(&state, &slug).await?;
    Ok(Json(ApiOk {
        data: ClinicPage {
            booking_path: format!("/api/v1/public/clinics/{}/bookings", clinic.slug),
            name: clinic.name,
            slug: clinic.slug,
            brand_color: clinic.brand_color,
            logo_url: clinic.logo_url,
        },
    }))
}

/* -------------------------
   POST /public/clinics/{slug}/bookings
--------------------------*/

#[derive(Debug, Deserialize)]
pub struct PublicBookingRequest {
    #[serde(flatten)]
    pub booking: BookingInput,
    #[serde(default)]
    pub marketing_opt_in: bool,
}

#[derive(Debug, Serialize)]
pub struct PublicBookingReceipt {
    pub booking_id: Uuid,
    pub status: &'static str,
}

pub async fn request_booking(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Json(req): Json<PublicBookingRequest>,
) -> Result<Json<ApiOk<PublicBookingReceipt>>, ApiError> {
    let clinic = clinic_by_slug(&state, &slug).await?;
    let booking = clean_booking(req.booking)?;

    let mut tx = state.db.begin().await.map_err(db_error)?;
    let row = insert_booking(&mut *tx, clinic.clinic_id, &booking).await?;
    let (lead_id, created) = link_or_create_lead(
        &mut tx,
        &Contact {
            name: &booking.patient_name,
            email: booking.patient_email.as_deref(),
            phone: booking.patient_phone.as_deref(),
            clinic_id: Some(clinic.clinic_id),
            source: LeadSource::Booking,
            marketing_opt_in: req.marketing_opt_in,
            notes: booking.notes.as_deref(),
        },
    )
    .await?;
    tx.commit().await.map_err(db_error)?;

    tracing::info!(
        booking_id = %row.booking_id,
        clinic = %clinic.slug,
        %lead_id,
        lead_created = created,
        "public booking received"
    );
    Ok(Json(ApiOk {
        data: PublicBookingReceipt {
            booking_id: row.booking_id,
            status: row.status.as_str(),
        },
    }))
}

/* -------------------------
   POST /public/chatbot/leads
--------------------------*/

#[derive(Debug, Deserialize)]
pub struct ChatbotLeadRequest {
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub clinic_slug: Option<String>,
    /// Conversation summary from the widget.
    pub notes: Option<String>,
    #[serde(default)]
    pub marketing_opt_in: bool,
}

#[derive(Debug, Serialize)]
pub struct CapturedLead {
    pub lead_id: Uuid,
    pub created: bool,
}

pub async fn capture_chatbot_lead(
    State(state): State<AppState>,
    Json(req): Json<ChatbotLeadRequest>,
) -> Result<Json<ApiOk<CapturedLead>>, ApiError> {
    let name = required_text(&req.name, "name", 200)?;
    let email = clean_opt(req.email)
        .map(|e| e.to_ascii_lowercase())
        .map(|e| {
            if is_plausible_email(&e) {
                Ok(e)
            } else {
                Err(ApiError::validation("email is invalid"))
            }
        })
        .transpose()?;
    let phone = clean_opt(req.phone)
        .map(|p| normalize_phone(&p).ok_or_else(|| ApiError::validation("phone is invalid")))
        .transpose()?;
    if email.is_none() && phone.is_none() {
        return Err(ApiError::validation("email or phone is required"));
    }
    let notes = clean_opt(req.notes).map(|n| n.chars().take(4000).collect::<String>());

    let clinic_id = match clean_opt(req.clinic_slug) {
        Some(slug) => Some(clinic_by_slug(&state, &slug).await?.clinic_id),
        None => None,
    };

    let mut tx = state.db.begin().await.map_err(db_error)?;
    let (lead_id, created) = link_or_create_lead(
        &mut tx,
        &Contact {
            name: &name,
            email: email.as_deref(),
            phone: phone.as_deref(),
            clinic_id,
            source: LeadSource::Chatbot,
            marketing_opt_in: req.marketing_opt_in,
            notes: notes.as_deref(),
        },
    )
    .await?;
    tx.commit().await.map_err(db_error)?;

    tracing::info!(%lead_id, created, clinic_id = ?clinic_id, "chatbot lead captured");
    Ok(Json(ApiOk {
        data: CapturedLead { lead_id, created },
    }))
}

/* -------------------------
   GET /public/unsubscribe/{lead_id}
--------------------------*/

#[derive(Debug, Serialize)]
pub struct Unsubscribed {
    pub unsubscribed: bool,
}

/// Idempotent. Clears consent and the pending schedule.
pub async fn unsubscribe(
    State(state): State<AppState>,
    Path(lead_id): Path<Uuid>,
) -> Result<Json<ApiOk<Unsubscribed>>, ApiError> {
    let updated = sqlx::query(
        r#"
        UPDATE lead
        SET status = 'unsubscribed',
            marketing_opt_in = FALSE,
            next_due_at = NULL,
            updated_at = now()
        WHERE lead_id = $1
        "#,
    )
    .bind(lead_id)
    .execute(&state.db)
    .await
    .map_err(db_error)?
    .rows_affected();

    if updated == 0 {
        return Err(ApiError::not_found("lead"));
    }
    tracing::info!(%lead_id, "lead unsubscribed via link");
    Ok(Json(ApiOk {
        data: Unsubscribed { unsubscribed: true },
    }))
}
