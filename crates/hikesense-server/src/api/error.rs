//! API error types and response handling.
//!
//! This module provides a unified error type for all API handlers
//! with automatic conversion to appropriate HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use hikesense_core::HikeSenseError;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Result type alias for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;

/// Unified API error type.
///
/// Each variant maps to a specific HTTP status code and produces a
/// consistent JSON error response.
#[derive(Debug, Clone)]
pub enum ApiError {
    /// 400 Bad Request - Invalid input from client.
    BadRequest {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 403 Forbidden - The platform refused access.
    Forbidden {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 404 Not Found - Resource does not exist.
    NotFound {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 409 Conflict - Operation cannot be completed due to current state.
    Conflict {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 422 Unprocessable Entity - Well-formed but semantically invalid data.
    UnprocessableEntity {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 424 Failed Dependency - A required upstream service is not configured.
    FailedDependency {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
        /// Optional additional details.
        details: Option<String>,
    },

    /// 500 Internal Server Error - Unexpected server-side error.
    InternalError {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
        /// Optional details (not exposed to client in production).
        details: Option<String>,
    },

    /// 502 Bad Gateway - The sensor or the account service misbehaved.
    BadGateway {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 503 Service Unavailable - External service (Bluetooth) is unavailable.
    ServiceUnavailable {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
        /// Optional additional details.
        details: Option<String>,
    },

    /// 504 Gateway Timeout - The sensor did not show up in time.
    GatewayTimeout {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },
}

/// Standard JSON error response body.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "error": "invalid_transition",
    "message": "Cannot start while session is no_selection",
    "details": null
}))]
pub struct ErrorResponse {
    /// Machine-readable error code (e.g., "discovery_timeout").
    #[schema(example = "invalid_transition")]
    pub error: String,

    /// Human-readable error message.
    #[schema(example = "Cannot start while session is no_selection")]
    pub message: String,

    /// Optional additional details for debugging.
    #[schema(nullable)]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    /// 503 returned when no adapter could be opened at startup.
    #[must_use]
    pub fn bluetooth_unavailable() -> Self {
        Self::ServiceUnavailable {
            error_code: "bluetooth_unavailable".to_string(),
            message: "Bluetooth adapter is not available".to_string(),
            details: None,
        }
    }

    /// HTTP status this error is sent with.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Self::Forbidden { .. } => StatusCode::FORBIDDEN,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Conflict { .. } => StatusCode::CONFLICT,
            Self::UnprocessableEntity { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::FailedDependency { .. } => StatusCode::FAILED_DEPENDENCY,
            Self::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::BadGateway { .. } => StatusCode::BAD_GATEWAY,
            Self::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::GatewayTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error_response = match self {
            Self::BadRequest {
                error_code,
                message,
            }
            | Self::Forbidden {
                error_code,
                message,
            }
            | Self::NotFound {
                error_code,
                message,
            }
            | Self::Conflict {
                error_code,
                message,
            }
            | Self::UnprocessableEntity {
                error_code,
                message,
            }
            | Self::BadGateway {
                error_code,
                message,
            }
            | Self::GatewayTimeout {
                error_code,
                message,
            } => ErrorResponse {
                error: error_code,
                message,
                details: None,
            },

            Self::InternalError {
                error_code,
                message,
                details,
            } => {
                // Log internal errors
                tracing::error!(
                    error_code = %error_code,
                    message = %message,
                    details = ?details,
                    "Internal server error"
                );

                ErrorResponse {
                    error: error_code,
                    message,
                    details: details.map(|d| serde_json::json!(d)),
                }
            }

            Self::FailedDependency {
                error_code,
                message,
                details,
            }
            | Self::ServiceUnavailable {
                error_code,
                message,
                details,
            } => ErrorResponse {
                error: error_code,
                message,
                details: details.map(|d| serde_json::json!(d)),
            },
        };

        (status, Json(error_response)).into_response()
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadRequest { message, .. } => write!(f, "Bad Request: {message}"),
            Self::Forbidden { message, .. } => write!(f, "Forbidden: {message}"),
            Self::NotFound { message, .. } => write!(f, "Not Found: {message}"),
            Self::Conflict { message, .. } => write!(f, "Conflict: {message}"),
            Self::UnprocessableEntity { message, .. } => {
                write!(f, "Unprocessable Entity: {message}")
            }
            Self::FailedDependency { message, .. } => {
                write!(f, "Failed Dependency: {message}")
            }
            Self::InternalError { message, .. } => {
                write!(f, "Internal Error: {message}")
            }
            Self::BadGateway { message, .. } => write!(f, "Bad Gateway: {message}"),
            Self::ServiceUnavailable { message, .. } => {
                write!(f, "Service Unavailable: {message}")
            }
            Self::GatewayTimeout { message, .. } => write!(f, "Gateway Timeout: {message}"),
        }
    }
}

impl std::error::Error for ApiError {}

/// Convert from hikesense_core errors.
impl From<HikeSenseError> for ApiError {
    fn from(err: HikeSenseError) -> Self {
        let error_code = err.error_code().to_ascii_lowercase();
        let message = err.to_string();

        match err.http_status_code() {
            403 => Self::Forbidden {
                error_code,
                message,
            },
            404 => Self::NotFound {
                error_code,
                message,
            },
            409 => Self::Conflict {
                error_code,
                message,
            },
            422 => Self::UnprocessableEntity {
                error_code,
                message,
            },
            424 => Self::FailedDependency {
                error_code,
                message,
                details: None,
            },
            502 => Self::BadGateway {
                error_code,
                message,
            },
            503 => Self::ServiceUnavailable {
                error_code,
                message,
                details: None,
            },
            504 => Self::GatewayTimeout {
                error_code,
                message,
            },
            _ => Self::InternalError {
                error_code,
                message,
                details: None,
            },
        }
    }
}

impl From<hikesense_core::LinkError> for ApiError {
    fn from(err: hikesense_core::LinkError) -> Self {
        Self::from(HikeSenseError::from(err))
    }
}

impl From<hikesense_core::SessionError> for ApiError {
    fn from(err: hikesense_core::SessionError) -> Self {
        Self::from(HikeSenseError::from(err))
    }
}

impl From<hikesense_core::BackendError> for ApiError {
    fn from(err: hikesense_core::BackendError) -> Self {
        Self::from(HikeSenseError::from(err))
    }
}

impl From<hikesense_core::ConfigError> for ApiError {
    fn from(err: hikesense_core::ConfigError) -> Self {
        Self::from(HikeSenseError::from(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hikesense_core::bluetooth::LinkState;
    use hikesense_core::session::{SessionAction, SessionState};
    use hikesense_core::{LinkError, SessionError};

    #[test]
    fn test_bad_request_error() {
        let err = ApiError::BadRequest {
            error_code: "test_error".to_string(),
            message: "Test message".to_string(),
        };
        assert!(err.to_string().contains("Bad Request"));
    }

    #[test]
    fn test_error_response_serialization() {
        let response = ErrorResponse {
            error: "test_error".to_string(),
            message: "Test message".to_string(),
            details: None,
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("test_error"));
    }

    #[test]
    fn test_link_errors_map_to_statuses() {
        let err = ApiError::from(LinkError::PermissionDenied);
        assert_eq!(err.status(), StatusCode::FORBIDDEN);

        let err = ApiError::from(LinkError::DiscoveryTimeout { duration_secs: 30 });
        assert_eq!(err.status(), StatusCode::GATEWAY_TIMEOUT);

        let err = ApiError::from(LinkError::Busy {
            state: LinkState::Streaming,
        });
        assert_eq!(err.status(), StatusCode::CONFLICT);

        let err = ApiError::from(LinkError::AdapterNotFound);
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_invalid_transition_is_conflict() {
        let err = ApiError::from(SessionError::InvalidTransition {
            from: SessionState::NoSelection,
            action: SessionAction::Start,
        });
        assert_eq!(err.status(), StatusCode::CONFLICT);
        match err {
            ApiError::Conflict { error_code, .. } => assert_eq!(error_code, "invalid_transition"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
