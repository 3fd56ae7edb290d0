//! Account service credentials.

use axum::extract::State;
use axum::Json;
use hikesense_core::Backend;
use serde::{Deserialize, Serialize};
use tracing::info;
use utoipa::ToSchema;

use crate::api::error::{ApiError, ApiResult};
use crate::state::SharedState;

/// Request body for handing over the bearer token.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[schema(example = json!({ "token": "eyJhbGciOiJIUzI1NiJ9..." }))]
pub struct UpdateTokenRequest {
    /// Bearer token, or `null` to log out.
    pub token: Option<String>,
}

/// Whether outgoing calls are authenticated.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TokenResponse {
    /// `true` once a token is present.
    #[schema(example = true)]
    pub authenticated: bool,
}

/// Replace the backend bearer token.
#[utoipa::path(
    put,
    path = "/api/backend/token",
    tag = "backend",
    operation_id = "updateBackendToken",
    summary = "Set the account service token",
    description = "The UI calls this after login so alerts, SOS calls and \
        session submissions are authenticated. The token is kept in memory \
        only.",
    request_body = UpdateTokenRequest,
    responses(
        (status = 200, description = "Token replaced", body = TokenResponse),
        (status = 400, description = "Empty token", body = crate::api::ErrorResponse)
    )
)]
pub async fn update_token(
    State(state): State<SharedState>,
    Json(request): Json<UpdateTokenRequest>,
) -> ApiResult<Json<TokenResponse>> {
    let token = match request.token {
        Some(token) if token.trim().is_empty() => {
            return Err(ApiError::BadRequest {
                error_code: "empty_token".to_string(),
                message: "Token cannot be empty. Send null to log out.".to_string(),
            });
        }
        other => other,
    };
    let authenticated = token.is_some();

    let backend = std::sync::Arc::clone(&state.read().await.backend);
    backend.set_token(token).await;
    info!(authenticated, "Backend token updated");

    Ok(Json(TokenResponse { authenticated }))
}
