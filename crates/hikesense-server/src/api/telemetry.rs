//! Live telemetry endpoint.

use axum::extract::State;
use axum::Json;
use hikesense_core::{AlertSnapshot, Reading};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::state::SharedState;

/// Latest reading and alert state.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TelemetryResponse {
    /// Most recent reading, if any arrived yet.
    pub latest_reading: Option<Reading>,

    /// Detector window, throttle and dispatch counters.
    pub alerts: AlertSnapshot,
}

/// Get live telemetry.
#[utoipa::path(
    get,
    path = "/api/telemetry",
    tag = "telemetry",
    operation_id = "getTelemetry",
    summary = "Get latest heart rate and alert state",
    description = "Returns the most recent reading together with the anomaly \
        detector's window, the time of the last dispatched alert and the \
        outcome of the last reading.",
    responses(
        (status = 200, description = "Telemetry snapshot", body = TelemetryResponse)
    )
)]
pub async fn get_telemetry(State(state): State<SharedState>) -> Json<TelemetryResponse> {
    let (latest_reading, monitor) = {
        let state_guard = state.read().await;
        let snapshot = (
            *state_guard.latest.borrow(),
            std::sync::Arc::clone(&state_guard.monitor),
        );
        snapshot
    };
    let alerts = monitor.lock().await.snapshot();

    Json(TelemetryResponse {
        latest_reading,
        alerts,
    })
}
