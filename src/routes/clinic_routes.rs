// src/routes/clinic_routes.rs

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    error::{db_error, ApiError},
    middleware::auth_context::OperatorContext,
    models::{ok, clean_opt, ApiOk, AppState, ClinicRow, OkData},
    slug::{slugify, validate_brand_color, validate_slug},
};

use super::{deserialize_double_option, required_text};

pub(crate) const CLINIC_COLUMNS: &str =
    "clinic_id, name, slug, brand_color, logo_url, owner_id, created_at, updated_at";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/clinics", get(list_clinics).post(create_clinic))
        .route(
            "/clinics/{clinic_id}",
            get(get_clinic).patch(update_clinic).delete(delete_clinic),
        )
}

#[derive(Debug, Deserialize)]
pub struct CreateClinicRequest {
    pub name: String,
    pub slug: Option<String>,
    pub brand_color: Option<String>,
    pub logo_url: Option<String>,
    pub owner_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateClinicRequest {
    pub name: Option<String>,
    pub slug: Option<String>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub brand_color: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub logo_url: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub owner_id: Option<Option<Uuid>>,
}

fn checked_slug(raw: &str) -> Result<String, ApiError> {
    let slug = raw.trim().to_string();
    validate_slug(&slug).map_err(ApiError::validation)?;
    Ok(slug)
}

fn checked_color(raw: Option<String>) -> Result<Option<String>, ApiError> {
    clean_opt(raw)
        .map(|c| validate_brand_color(&c).map_err(ApiError::validation))
        .transpose()
}

fn checked_logo(raw: Option<String>) -> Result<Option<String>, ApiError> {
    match clean_opt(raw) {
        Some(url) if !(url.starts_with("https://") || url.starts_with("http://")) => {
            Err(ApiError::validation("logo_url must be an http(s) URL"))
        }
        other => Ok(other),
    }
}

pub(crate) async fn fetch_clinic(state: &AppState, clinic_id: Uuid) -> Result<ClinicRow, ApiError> {
    sqlx::query_as::<_, ClinicRow>(&format!(
        "SELECT {CLINIC_COLUMNS} FROM clinic WHERE clinic_id = $1"
    ))
    .bind(clinic_id)
    .fetch_optional(&state.db)
    .await
    .map_err(db_error)?
    .ok_or_else(|| ApiError::not_found("clinic"))
}

pub async fn list_clinics(
    State(state): State<AppState>,
    _op: OperatorContext,
) -> Result<Json<ApiOk<Vec<ClinicRow>>>, ApiError> {
    let rows = sqlx::query_as::<_, ClinicRow>(&format!(
        "SELECT {CLINIC_COLUMNS} FROM clinic ORDER BY name ASC"
    ))
    .fetch_all(&state.db)
    .await
    .map_err(db_error)?;

    Ok(Json(ApiOk { data: rows }))
}

pub async fn get_clinic(
    State(state): State<AppState>,
    _op: OperatorContext,
    Path(clinic_id): Path<Uuid>,
) -> Result<Json<ApiOk<ClinicRow>>, ApiError> {
    Ok(Json(ApiOk {
        data: fetch_clinic(&state, clinic_id).await?,
    }))
}

pub async fn create_clinic(
    State(state): State<AppState>,
    _op: OperatorContext,
    Json(req): Json<CreateClinicRequest>,
) -> Result<Json<ApiOk<ClinicRow>>, ApiError> {
    let name = required_text(&req.name, "name", 128)?;
    let slug = match clean_opt(req.slug) {
        Some(s) => checked_slug(&s)?,
        None => slugify(&name)
            .ok_or_else(|| ApiError::validation("cannot derive a slug from name; pass one"))?,
    };
    let brand_color = checked_color(req.brand_color)?;
    let logo_url = checked_logo(req.logo_url)?;

    let row = sqlx::query_as::<_, ClinicRow>(&format!(
        r#"
        INSERT INTO clinic (name, slug, brand_color, logo_url, owner_id)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING {CLINIC_COLUMNS}
        "#
    ))
    .bind(&name)
    .bind(&slug)
    .bind(brand_color)
    .bind(logo_url)
    .bind(req.owner_id)
    .fetch_one(&state.db)
    .await
    .map_err(db_error)?;

    tracing::info!(clinic_id = %row.clinic_id, slug = %row.slug, "clinic created");
    Ok(Json(ApiOk { data: row }))
}

pub async fn update_clinic(
    State(state): State<AppState>,
    _op: OperatorContext,
    Path(clinic_id): Path<Uuid>,
    Json(req): Json<UpdateClinicRequest>,
) -> Result<Json<ApiOk<ClinicRow>>, ApiError> {
    let existing = fetch_clinic(&state, clinic_id).await?;

    let name = match req.name.as_deref() {
        Some(n) => required_text(n, "name", 128)?,
        None => existing.name,
    };
    let slug = match req.slug.as_deref() {
        Some(s) => checked_slug(s)?,
        None => existing.slug,
    };
    let brand_color = match req.brand_color {
        None => existing.brand_color,
        Some(v) => checked_color(v)?,
    };
    let logo_url = match req.logo_url {
        None => existing.logo_url,
        Some(v) => checked_logo(v)?,
    };
    let owner_id = match req.owner_id {
        None => existing.owner_id,
        Some(v) => v,
    };

    let row = sqlx::query_as::<_, ClinicRow>(&format!(
        r#"
        UPDATE clinic
        SET name = $2,
            slug = $3,
            brand_color = $4,
            logo_url = $5,
            owner_id = $6,
            updated_at = now()
        WHERE clinic_id = $1
        RETURNING {CLINIC_COLUMNS}
        "#
    ))
    .bind(clinic_id)
    .bind(name)
    .bind(slug)
    .bind(brand_color)
    .bind(logo_url)
    .bind(owner_id)
    .fetch_optional(&state.db)
    .await
    .map_err(db_error)?
    .ok_or_else(|| ApiError::not_found("clinic"))?;

    Ok(Json(ApiOk { data: row }))
}

/// Fails with `IN_USE` while leads still point at the clinic.
pub async fn delete_clinic(
    State(state): State<AppState>,
    _op: OperatorContext,
    Path(clinic_id): Path<Uuid>,
) -> Result<Json<ApiOk<OkData>>, ApiError> {
    let deleted = sqlx::query("DELETE FROM clinic WHERE clinic_id = $1")
        .bind(clinic_id)
        .execute(&state.db)
        .await
        .map_err(db_error)?
        .rows_affected();

    if deleted == 0 {
        return Err(ApiError::not_found("clinic"));
    }
    tracing::info!(%clinic_id, "clinic deleted");
    Ok(Json(ok()))
}
