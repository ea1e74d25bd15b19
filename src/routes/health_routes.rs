use axum::{Json, Router, extract::State, routing::get};
use serde::Serialize;

use crate::error::ApiError;
use crate::models::{ApiOk, AppState};

#[derive(Debug, Serialize)]
pub struct HealthData {
    pub status: &'static str,
    pub database: bool,
    pub engine_running: bool,
    pub engine_paused: bool,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health))
}

/// Public liveness probe. Reports a degraded database instead of failing.
pub async fn health(State(state): State<AppState>) -> Result<Json<ApiOk<HealthData>>, ApiError> {
    let database = sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(&state.db)
        .await
        .is_ok();

    let (engine_running, engine_paused) = if database {
        match state.engine.status().await {
            Ok(s) => (s.is_running, s.is_paused),
            Err(e) => {
                tracing::warn!(error = %e, "health: engine state unavailable");
                (false, false)
            }
        }
    } else {
        (false, false)
    };

    Ok(Json(ApiOk {
        data: HealthData {
            status: if database { "ok" } else { "degraded" },
            database,
            engine_running,
            engine_paused,
        },
    }))
}
