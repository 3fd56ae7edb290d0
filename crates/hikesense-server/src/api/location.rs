//! Position reporting endpoint.
//!
//! The daemon has no GPS of its own; the UI pushes the phone's position here
//! so alerts and SOS calls can carry it.

use axum::extract::State;
use axum::Json;
use hikesense_core::GeoPoint;
use serde::{Deserialize, Serialize};
use tracing::debug;
use utoipa::ToSchema;

use crate::state::SharedState;

/// Request body for reporting the current position.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "location": {"latitude": 46.7860, "longitude": -121.7355}
}))]
pub struct UpdateLocationRequest {
    /// Current position, or `null` when the fix was lost.
    pub location: Option<GeoPoint>,
}

/// Position now attached to outgoing alerts.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LocationResponse {
    /// Stored position.
    pub location: Option<GeoPoint>,
}

/// Report the user's position.
#[utoipa::path(
    put,
    path = "/api/location",
    tag = "telemetry",
    operation_id = "updateLocation",
    summary = "Report current position",
    description = "Stores the position attached to heart rate alerts and SOS \
        calls. Send `null` to clear it when the fix is lost.",
    request_body = UpdateLocationRequest,
    responses(
        (status = 200, description = "Position stored", body = LocationResponse)
    )
)]
pub async fn update_location(
    State(state): State<SharedState>,
    Json(request): Json<UpdateLocationRequest>,
) -> Json<LocationResponse> {
    let location = std::sync::Arc::clone(&state.read().await.location);
    match request.location {
        Some(point) => location.update(point).await,
        None => location.clear().await,
    }
    debug!(has_fix = request.location.is_some(), "Location reported");

    Json(LocationResponse {
        location: request.location,
    })
}
