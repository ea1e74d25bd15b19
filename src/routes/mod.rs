use crate::error::ApiError;
use crate::models::AppState;
use axum::Router;
use serde::{Deserialize, Deserializer};

pub mod analytics_routes;
pub mod booking_routes;
pub mod campaign_routes;
pub mod clinic_routes;
pub mod engine_routes;
pub mod health_routes;
pub mod lead_routes;
pub mod public_routes;
pub mod sequence_routes;
pub mod template_routes;
pub mod user_routes;

pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1/users", user_routes::router())
        .nest("/api/v1/engine", engine_routes::router())
        .nest("/api/v1/public", public_routes::router())
        .nest("/api/v1", clinic_routes::router())
        .nest("/api/v1", lead_routes::router())
        .nest("/api/v1", sequence_routes::router())
        .nest("/api/v1", campaign_routes::router())
        .nest("/api/v1", booking_routes::router())
        .nest("/api/v1", template_routes::router())
        .nest("/api/v1", analytics_routes::router())
        .merge(health_routes::router())
        .with_state(state)
}

/// PATCH helper: absent field => `None`, explicit `null` => `Some(None)`.
pub(crate) fn deserialize_double_option<'de, D, T>(
    deserializer: D,
) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    let inner = Option::<T>::deserialize(deserializer)?;
    Ok(Some(inner))
}

/// Trimmed, non-empty, bounded text.
pub(crate) fn required_text(value: &str, field: &str, max: usize) -> Result<String, ApiError> {
    let v = value.trim();
    if v.is_empty() {
        return Err(ApiError::validation(format!("{field} is required")));
    }
    if v.chars().count() > max {
        return Err(ApiError::validation(format!("{field} is too long (max {max})")));
    }
    Ok(v.to_string())
}

/// Parses a closed-enum query/body value, mapping failures to 400.
pub(crate) fn parse_field<T>(raw: &str) -> Result<T, ApiError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|e| ApiError::validation(e.to_string()))
}

pub(crate) fn page(limit: Option<i64>, offset: Option<i64>) -> (i64, i64) {
    (limit.unwrap_or(50).clamp(1, 500), offset.unwrap_or(0).max(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize)]
    struct Patch {
        #[serde(default, deserialize_with = "deserialize_double_option")]
        notes: Option<Option<String>>,
    }

    #[test]
    fn test_double_option_distinguishes_null_from_absent() {
        let absent: Patch = serde_json::from_str("{}").unwrap();
        assert_eq!(absent.notes, None);
        let null: Patch = serde_json::from_str(r#"{"notes":null}"#).unwrap();
        assert_eq!(null.notes, Some(None));
        let set: Patch = serde_json::from_str(r#"{"notes":"hi"}"#).unwrap();
        assert_eq!(set.notes, Some(Some("hi".into())));
    }

    #[test]
    fn test_required_text_and_paging() {
        assert_eq!(required_text("  Ana ", "name", 10).unwrap(), "Ana");
        assert!(required_text("   ", "name", 10).is_err());
        assert!(required_text("abcdefghijk", "name", 10).is_err());
        assert_eq!(page(None, None), (50, 0));
        assert_eq!(page(Some(10_000), Some(-4)), (500, 0));
    }
}
