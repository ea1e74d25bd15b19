use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum_extra::TypedHeader;
use headers::{Authorization, authorization::Bearer};

use crate::auth::token_matches;
use crate::error::ApiError;
use crate::models::AppState;

/// Proof that the caller presented the operator bearer token.
#[derive(Debug, Clone)]
pub struct OperatorContext {
    /// First characters of the token hash, for log correlation only.
    pub token_fingerprint: String,
}

impl FromRequestParts<AppState> for OperatorContext {
    type Rejection = ApiError;

    fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        async move {
            // Extract Authorization: Bearer <token>
            let TypedHeader(authz): TypedHeader<Authorization<Bearer>> =
                TypedHeader::from_request_parts(parts, state)
                    .await
                    .map_err(|_| ApiError::invalid_token())?;

            if !token_matches(authz.token(), &state.operator_token_sha256) {
                tracing::warn!("rejected request with invalid operator token");
                return Err(ApiError::invalid_token());
            }

            Ok(OperatorContext {
                token_fingerprint: state
                    .operator_token_sha256
                    .get(..8)
                    .unwrap_or_default()
                    .to_string(),
            })
        }
    }
}
