//! HTTP API routes and handlers.
//!
//! This module contains all HTTP endpoint implementations organized by domain:
//! - `device` - Sensor discovery, connection and teardown
//! - `telemetry` - Latest reading and alert state
//! - `location` - Position reported by the UI
//! - `session` - Hike lifecycle, submission and SOS
//! - `backend` - Account service token
//! - `health` - Service health checks
//! - `error` - API error types
//! - `openapi` - OpenAPI specification generation

use axum::routing::{get, put};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::state::SharedState;

pub mod backend;
pub mod device;
pub mod error;
pub mod health;
pub mod location;
pub mod openapi;
pub mod session;
pub mod telemetry;

// Re-export commonly used types
pub use error::{ApiError, ApiResult, ErrorResponse};

// Re-export OpenAPI utilities for the gen-openapi binary
pub use openapi::get_openapi_json;

/// Creates the combined API router with all endpoints.
///
/// # Route Structure
///
/// ```text
/// /health                - Health check
/// /api
/// ├── /device            - Link status, connect, disconnect
/// ├── /telemetry         - Latest reading and alert state
/// ├── /location          - Position reported by the UI
/// ├── /backend/token     - Account service token
/// ├── /session           - Hike lifecycle and SOS
/// ├── /openapi.json      - OpenAPI specification
/// └── /docs              - Swagger UI
/// ```
pub fn create_router(state: SharedState) -> Router {
    let api = Router::new()
        .nest("/device", device::router())
        .route("/telemetry", get(telemetry::get_telemetry))
        .route("/location", put(location::update_location))
        .route("/backend/token", put(backend::update_token))
        .nest("/session", session::router())
        .route("/openapi.json", get(openapi::get_openapi_spec));

    Router::new()
        .route("/health", get(health::health_check))
        .nest("/api", api)
        .merge(SwaggerUi::new("/api/docs").url("/api/docs/openapi.json", openapi::ApiDoc::openapi()))
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                        .on_response(DefaultOnResponse::new().level(Level::INFO)),
                )
                .layer(CorsLayer::permissive())
                .layer(CompressionLayer::new()),
        )
        .with_state(state)
}
