//! OpenAPI specification generation for the HikeSense daemon API.
//!
//! The document is served at `/api/openapi.json`, browsable at `/api/docs`,
//! and written to disk by the `gen-openapi` binary for client generation.

use axum::Json;
use hikesense_core::anomaly::{AlertOutcome, AlertSnapshot, AnomalyKind};
use hikesense_core::bluetooth::{LinkState, Peripheral, PeripheralId, PeripheralState};
use hikesense_core::session::{Delivery, SessionRecord, SessionSnapshot, SessionState};
use hikesense_core::{GeoPoint, HealthResponse, Hike, HikeAlert, Reading, SubmissionReport};
use utoipa::OpenApi;

use super::backend::{TokenResponse, UpdateTokenRequest};
use super::device::{ConnectResponse, DeviceStatusResponse, DisconnectResponse};
use super::error::ErrorResponse;
use super::location::{LocationResponse, UpdateLocationRequest};
use super::session::{FavouriteRequest, SosResponse};
use super::telemetry::TelemetryResponse;

/// Serve the OpenAPI specification as JSON.
pub async fn get_openapi_spec() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// Returns the OpenAPI specification as a pretty-printed string.
///
/// # Errors
///
/// Returns an error if the document cannot be serialized.
pub fn get_openapi_json() -> serde_json::Result<String> {
    ApiDoc::openapi().to_pretty_json()
}

/// Main OpenAPI document structure for the HikeSense daemon.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "HikeSense API",
        version = "0.1.0",
        description = r#"
# HikeSense API

Local daemon behind the HikeSense hiking companion.

## Overview

1. **Sensor link**: connect to the `HikeSenseBLE` wearable and stream heart rate
2. **Alerts**: five consecutive readings above 200 bpm or below 40 bpm send an
   alert to the account service, at most once every ten minutes
3. **Sessions**: select a hike, start, pause and finish it, then submit the
   summary with the favourite flag
4. **SOS**: send a distress signal with the last reported position

The UI reports the phone's position via `PUT /api/location` and hands over the
login token via `PUT /api/backend/token`.
"#,
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    ),
    servers(
        (url = "/", description = "Local HikeSense daemon")
    ),
    tags(
        (name = "system", description = "Health checks"),
        (name = "device", description = "Heart rate sensor discovery and connection"),
        (name = "telemetry", description = "Live heart rate, alert state and position"),
        (name = "session", description = "Hike lifecycle, submission and SOS"),
        (name = "backend", description = "Account service credentials")
    ),
    paths(
        super::health::health_check,
        super::device::get_device,
        super::device::connect,
        super::device::disconnect,
        super::telemetry::get_telemetry,
        super::location::update_location,
        super::backend::update_token,
        super::session::get_session,
        super::session::select_hike,
        super::session::start_hike,
        super::session::pause_hike,
        super::session::finish_hike,
        super::session::abandon_hike,
        super::session::decide_favourite,
        super::session::send_sos,
    ),
    components(
        schemas(
            // Error types
            ErrorResponse,
            // Health types
            HealthResponse,
            // Shared types
            GeoPoint,
            Reading,
            Hike,
            HikeAlert,
            // Device types
            DeviceStatusResponse,
            ConnectResponse,
            DisconnectResponse,
            LinkState,
            Peripheral,
            PeripheralId,
            PeripheralState,
            // Telemetry types
            TelemetryResponse,
            AlertSnapshot,
            AlertOutcome,
            AnomalyKind,
            UpdateLocationRequest,
            LocationResponse,
            // Backend types
            UpdateTokenRequest,
            TokenResponse,
            // Session types
            SessionSnapshot,
            SessionState,
            SessionRecord,
            SubmissionReport,
            Delivery,
            FavouriteRequest,
            SosResponse,
        )
    )
)]
pub struct ApiDoc;
