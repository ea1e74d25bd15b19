use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorObject,
}

#[derive(Debug, Serialize)]
pub struct ErrorObject {
    pub code: String,
    pub message: String,
}

#[derive(Debug)]
pub enum ApiError {
    Unauthorized(&'static str, String),
    #[allow(dead_code)]
    Forbidden(&'static str, String),
    BadRequest(&'static str, String),
    NotFound(&'static str, String),
    Conflict(&'static str, String),
    Internal(String),
}

impl ApiError {
    pub fn invalid_token() -> Self {
        ApiError::Unauthorized("INVALID_TOKEN", "Missing or invalid operator token".into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        ApiError::BadRequest("VALIDATION_ERROR", message.into())
    }

    pub fn not_found(what: &str) -> Self {
        ApiError::NotFound("NOT_FOUND", format!("{what} not found"))
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized(..) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(..) => StatusCode::FORBIDDEN,
            ApiError::BadRequest(..) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(..) => StatusCode::NOT_FOUND,
            ApiError::Conflict(..) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn to_error_response(code: &str, message: &str) -> Json<ErrorResponse> {
        Json(ErrorResponse {
            error: ErrorObject {
                code: code.to_string(),
                message: message.to_string(),
            },
        })
    }
}

/// Maps constraint violations to 409s so callers can tell a duplicate slug
/// or a still-referenced row apart from an outage.
pub fn db_error(e: sqlx::Error) -> ApiError {
    if let sqlx::Error::Database(db) = &e {
        match db.code().as_deref() {
            Some("23505") => {
                let constraint = db.constraint().unwrap_or_default();
                if constraint.contains("slug") {
                    return ApiError::Conflict("SLUG_TAKEN", "slug is already in use".into());
                }
                return ApiError::Conflict("DUPLICATE", format!("duplicate value ({constraint})"));
            }
            Some("23503") => {
                return ApiError::Conflict(
                    "IN_USE",
                    "record is referenced by other records".into(),
                );
            }
            Some("23514") => {
                return ApiError::BadRequest("VALIDATION_ERROR", db.message().to_string());
            }
            _ => {}
        }
    }
    tracing::error!(error = %e, "database error");
    ApiError::Internal(format!("db error: {e}"))
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            ApiError::Unauthorized(code, msg)
            | ApiError::Forbidden(code, msg)
            | ApiError::BadRequest(code, msg)
            | ApiError::NotFound(code, msg)
            | ApiError::Conflict(code, msg) => {
                (status, ApiError::to_error_response(code, &msg)).into_response()
            }
            ApiError::Internal(msg) => {
                (status, ApiError::to_error_response("INTERNAL", &msg)).into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(ApiError::invalid_token().status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::validation("x").status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::not_found("lead").status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::Conflict("SLUG_TAKEN", "taken".into()).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::Internal("boom".into()).into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_non_database_errors_are_internal() {
        let err = db_error(sqlx::Error::RowNotFound);
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[derive(Debug)]
    struct PgViolation {
        code: &'static str,
        constraint: Option<&'static str>,
    }

    impl std::fmt::Display for PgViolation {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "violation {}", self.code)
        }
    }

    impl std::error::Error for PgViolation {}

    impl sqlx::error::DatabaseError for PgViolation {
        fn message(&self) -> &str {
            "constraint violated"
        }

        fn code(&self) -> Option<std::borrow::Cow<'_, str>> {
            Some(self.code.into())
        }

        fn constraint(&self) -> Option<&str> {
            self.constraint
        }

        fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn std::error::Error + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> sqlx::error::ErrorKind {
            match self.code {
                "23505" => sqlx::error::ErrorKind::UniqueViolation,
                "23503" => sqlx::error::ErrorKind::ForeignKeyViolation,
                "23514" => sqlx::error::ErrorKind::CheckViolation,
                _ => sqlx::error::ErrorKind::Other,
            }
        }
    }

    fn violation(code: &'static str, constraint: Option<&'static str>) -> ApiError {
        db_error(sqlx::Error::Database(Box::new(PgViolation { code, constraint })))
    }

    #[test]
    fn test_duplicate_clinic_slug_is_slug_taken() {
        let err = violation("23505", Some("clinic_slug_key"));
        assert_eq!(err.status(), StatusCode::CONFLICT);
        assert!(matches!(err, ApiError::Conflict("SLUG_TAKEN", _)));

        let err = violation("23505", Some("lead_email_key"));
        assert!(matches!(err, ApiError::Conflict("DUPLICATE", ref m) if m.contains("lead_email_key")));
    }

    #[test]
    fn test_referenced_row_is_in_use() {
        let err = violation("23503", Some("lead_clinic_id_fkey"));
        assert_eq!(err.status(), StatusCode::CONFLICT);
        assert!(matches!(err, ApiError::Conflict("IN_USE", _)));
    }

    #[test]
    fn test_check_violation_is_validation_error() {
        let err = violation("23514", Some("engine_state_daily_email_limit_check"));
        assert!(matches!(err, ApiError::BadRequest("VALIDATION_ERROR", _)));

        let err = violation("40001", None);
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
