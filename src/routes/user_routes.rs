// src/routes/user_routes.rs
//
// Clinic owners and staff. Accounts are records only; sign-in lives outside
// this service.

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    error::{db_error, ApiError},
    middleware::auth_context::OperatorContext,
    models::{is_plausible_email, ApiOk, AppState, UserRole, UserRow},
};

use super::required_text;

const USER_COLUMNS: &str = "user_id, email, display_name, role, is_active, created_at";

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub email: String,
    pub display_name: String,
    pub role: Option<UserRole>, // default staff
    pub is_active: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateUserRequest {
    pub display_name: Option<String>,
    pub role: Option<UserRole>,
    pub is_active: Option<bool>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        // /api/v1/users
        .route("/", get(list_users).post(create_user))
        // /api/v1/users/{user_id}
        .route("/{user_id}", get(get_user).patch(update_user))
        .route("/{user_id}/disable", post(disable_user))
        .route("/{user_id}/enable", post(enable_user))
}

pub async fn list_users(
    State(state): State<AppState>,
    _op: OperatorContext,
) -> Result<Json<ApiOk<Vec<UserRow>>>, ApiError> {
    let users = sqlx::query_as::<_, UserRow>(&format!(
        "SELECT {USER_COLUMNS} FROM app_user ORDER BY created_at DESC LIMIT 500"
    ))
    .fetch_all(&state.db)
    .await
    .map_err(db_error)?;

    Ok(Json(ApiOk { data: users }))
}

pub async fn get_user(
    State(state): State<AppState>,
    _op: OperatorContext,
    Path(user_id): Path<Uuid>,
) -> Result<Json<ApiOk<UserRow>>, ApiError> {
    let user = sqlx::query_as::<_, UserRow>(&format!(
        "SELECT {USER_COLUMNS} FROM app_user WHERE user_id = $1"
    ))
    .bind(user_id)
    .fetch_optional(&state.db)
    .await
    .map_err(db_error)?
    .ok_or_else(|| ApiError::not_found("user"))?;

    Ok(Json(ApiOk { data: user }))
}

pub async fn create_user(
    State(state): State<AppState>,
    _op: OperatorContext,
    Json(req): Json<CreateUserRequest>,
) -> Result<Json<ApiOk<UserRow>>, ApiError> {
    let email = req.email.trim().to_ascii_lowercase();
    if !is_plausible_email(&email) {
        return Err(ApiError::validation("email is invalid"));
    }
    let display_name = required_text(&req.display_name, "display_name", 128)?;

    let user = sqlx::query_as::<_, UserRow>(&format!(
        r#"
        INSERT INTO app_user (email, display_name, role, is_active)
        VALUES ($1, $2, $3, $4)
        RETURNING {USER_COLUMNS}
        "#
    ))
    .bind(&email)
    .bind(&display_name)
    .bind(req.role.unwrap_or(UserRole::Staff))
    .bind(req.is_active.unwrap_or(true))
    .fetch_one(&state.db)
    .await
    .map_err(|e| match db_error(e) {
        ApiError::Conflict("DUPLICATE", _) => {
            ApiError::Conflict("EMAIL_TAKEN", "a user with this email already exists".into())
        }
        other => other,
    })?;

    tracing::info!(user_id = %user.user_id, role = ?user.role, "user created");
    Ok(Json(ApiOk { data: user }))
}

pub async fn update_user(
    State(state): State<AppState>,
    _op: OperatorContext,
    Path(user_id): Path<Uuid>,
    Json(req): Json<UpdateUserRequest>,
) -> Result<Json<ApiOk<UserRow>>, ApiError> {
    let display_name = req
        .display_name
        .as_deref()
        .map(|n| required_text(n, "display_name", 128))
        .transpose()?;

    let user = sqlx::query_as::<_, UserRow>(&format!(
        r#"
        UPDATE app_user
        SET display_name = COALESCE($2, display_name),
            role         = COALESCE($3, role),
            is_active    = COALESCE($4, is_active)
        WHERE user_id = $1
        RETURNING {USER_COLUMNS}
        "#
    ))
    .bind(user_id)
    .bind(display_name)
    .bind(req.role)
    .bind(req.is_active)
    .fetch_optional(&state.db)
    .await
    .map_err(db_error)?
    .ok_or_else(|| ApiError::not_found("user"))?;

    Ok(Json(ApiOk { data: user }))
}

async fn set_active(state: &AppState, user_id: Uuid, active: bool) -> Result<UserRow, ApiError> {
    sqlx::query_as::<_, UserRow>(&format!(
        "UPDATE app_user SET is_active = $2 WHERE user_id = $1 RETURNING {USER_COLUMNS}"
    ))
    .bind(user_id)
    .bind(active)
    .fetch_optional(&state.db)
    .await
    .map_err(db_error)?
    .ok_or_else(|| ApiError::not_found("user"))
}

pub async fn disable_user(
    State(state): State<AppState>,
    _op: OperatorContext,
    Path(user_id): Path<Uuid>,
) -> Result<Json<ApiOk<UserRow>>, ApiError> {
    let user = set_active(&state, user_id, false).await?;
    tracing::info!(%user_id, "user disabled");
    Ok(Json(ApiOk { data: user }))
}

pub async fn enable_user(
    State(state): State<AppState>,
    _op: OperatorContext,
    Path(user_id): Path<Uuid>,
) -> Result<Json<ApiOk<UserRow>>, ApiError> {
    let user = set_active(&state, user_id, true).await?;
    Ok(Json(ApiOk { data: user }))
}
