//! Sensor link API endpoints.
//!
//! Connecting runs the full discovery sequence (permission, scan for the
//! configured name, connect, subscribe) and then starts the telemetry
//! pipeline in the background. Disconnecting tears the link down and waits
//! for the pipeline to drain.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use hikesense_core::bluetooth::{LinkState, Peripheral};
use hikesense_core::{run_pipeline, LinkError, Reading};
use serde::{Deserialize, Serialize};
use tracing::info;
use utoipa::ToSchema;

use crate::api::error::{ApiError, ApiResult};
use crate::state::{stop_telemetry, SharedState};

/// Creates the device router.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/", get(get_device))
        .route("/connect", post(connect))
        .route("/disconnect", post(disconnect))
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Sensor link status.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "available": true,
    "state": "streaming",
    "peripheral": {
        "id": "C8:2E:18:4A:90:11",
        "name": "HikeSenseBLE",
        "state": "connected"
    },
    "streaming": true,
    "latest_reading": {"bpm": 128, "captured_at": "2025-06-01T09:30:00Z"}
}))]
pub struct DeviceStatusResponse {
    /// Whether a Bluetooth adapter is usable at all.
    #[schema(example = true)]
    pub available: bool,

    /// Link state.
    pub state: LinkState,

    /// Attached sensor. Omitted while a discovery is in flight.
    pub peripheral: Option<Peripheral>,

    /// Whether readings are flowing into alerts and the session.
    #[schema(example = true)]
    pub streaming: bool,

    /// Most recent reading.
    pub latest_reading: Option<Reading>,
}

/// Response after the sensor was connected.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ConnectResponse {
    /// Link state, `streaming` on success.
    pub state: LinkState,

    /// The sensor that was found.
    pub peripheral: Peripheral,
}

/// Response after the sensor was released.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "state": "disconnected",
    "readings": 1820,
    "alerts_dispatched": 1
}))]
pub struct DisconnectResponse {
    /// Link state after teardown.
    pub state: LinkState,

    /// Readings the pipeline consumed.
    #[schema(example = 1820)]
    pub readings: u64,

    /// Alerts that reached the backend.
    #[schema(example = 1)]
    pub alerts_dispatched: u64,
}

// ============================================================================
// Handlers
// ============================================================================

/// Get the sensor link status.
#[utoipa::path(
    get,
    path = "/api/device",
    tag = "device",
    operation_id = "getDevice",
    summary = "Get sensor link status",
    description = "Returns the link state, the attached sensor and the most \
        recent heart rate reading. Never waits on an in-flight discovery.",
    responses(
        (status = 200, description = "Link status", body = DeviceStatusResponse)
    )
)]
pub async fn get_device(State(state): State<SharedState>) -> Json<DeviceStatusResponse> {
    let state_guard = state.read().await;
    let status = state_guard.link_status();

    let response = Json(DeviceStatusResponse {
        available: status.is_some(),
        state: status.as_ref().map_or(LinkState::Idle, |s| s.state),
        peripheral: status.and_then(|s| s.peripheral),
        streaming: state_guard.is_streaming(),
        latest_reading: *state_guard.latest.borrow(),
    });
    response
}

/// Discover, connect and start streaming.
#[utoipa::path(
    post,
    path = "/api/device/connect",
    tag = "device",
    operation_id = "connectDevice",
    summary = "Connect to the heart rate sensor",
    description = "Requests Bluetooth access, scans for the configured sensor \
        name, connects to the first match and subscribes to heart rate \
        notifications. Readings then feed the alert monitor and the hike \
        session until disconnected. The scan is bounded by \
        `device.discovery_timeout_secs`.",
    responses(
        (status = 200, description = "Sensor connected and streaming", body = ConnectResponse),
        (status = 403, description = "Bluetooth permission denied", body = crate::api::ErrorResponse),
        (status = 404, description = "Scan ended without a matching sensor", body = crate::api::ErrorResponse),
        (status = 409, description = "Already scanning, connecting or streaming, or cancelled by a disconnect", body = crate::api::ErrorResponse),
        (status = 502, description = "Connection or subscription failed", body = crate::api::ErrorResponse),
        (status = 503, description = "Bluetooth unavailable", body = crate::api::ErrorResponse),
        (status = 504, description = "No sensor found before the timeout", body = crate::api::ErrorResponse)
    )
)]
pub async fn connect(State(state): State<SharedState>) -> ApiResult<Json<ConnectResponse>> {
    let (link, monitor, session, latest) = {
        let state_guard = state.read().await;
        let link = state_guard
            .link
            .clone()
            .ok_or_else(ApiError::bluetooth_unavailable)?;
        (
            link,
            Arc::clone(&state_guard.monitor),
            Arc::clone(&state_guard.session),
            Arc::clone(&state_guard.latest),
        )
    };

    let (subscription, peripheral, link_state) = {
        let mut link = link.lock().await;
        let subscription = link.establish().await?;
        let peripheral = link.peripheral().cloned().ok_or(LinkError::NotConnected)?;
        (subscription, peripheral, link.state())
    };

    monitor.lock().await.reset_window();
    let pipeline = tokio::spawn(run_pipeline(subscription, monitor, session, latest));
    state.write().await.pipeline = Some(pipeline);

    info!(id = %peripheral.id, "Sensor streaming");
    Ok(Json(ConnectResponse {
        state: link_state,
        peripheral,
    }))
}

/// Release the sensor.
#[utoipa::path(
    post,
    path = "/api/device/disconnect",
    tag = "device",
    operation_id = "disconnectDevice",
    summary = "Disconnect from the sensor",
    description = "Cancels a scan in flight (the pending connect request then \
        fails with `409 discovery_cancelled`), stops the notification \
        subscription and disconnects. Safe to call when nothing is connected.",
    responses(
        (status = 200, description = "Sensor released", body = DisconnectResponse),
        (status = 503, description = "Bluetooth unavailable", body = crate::api::ErrorResponse)
    )
)]
pub async fn disconnect(State(state): State<SharedState>) -> ApiResult<Json<DisconnectResponse>> {
    let (link, scan, pipeline) = {
        let mut state_guard = state.write().await;
        let link = state_guard
            .link
            .clone()
            .ok_or_else(ApiError::bluetooth_unavailable)?;
        (link, state_guard.scan.clone(), state_guard.pipeline.take())
    };

    let summary = stop_telemetry(Some(Arc::clone(&link)), scan.as_ref(), pipeline)
        .await
        .unwrap_or_default();
    let link_state = link.lock().await.state();

    Ok(Json(DisconnectResponse {
        state: link_state,
        readings: summary.readings,
        alerts_dispatched: summary.alerts_dispatched,
    }))
}
