//! Hike session API endpoints.
//!
//! A session moves through `no_selection → selected → in_progress ⇄ paused →
//! awaiting_favorite_decision → completed`. Requests that do not fit the
//! current state are rejected with `409 invalid_transition`.
//!
//! Calls to the directions and account services run with the session
//! unlocked; the outcome is applied afterwards.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use hikesense_core::session::SessionSnapshot;
use hikesense_core::{Hike, SessionManager, SubmissionReport};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use utoipa::ToSchema;

use crate::api::error::ApiResult;
use crate::state::SharedState;

/// Creates the session router.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/", get(get_session))
        .route("/select", post(select_hike))
        .route("/start", post(start_hike))
        .route("/pause", post(pause_hike))
        .route("/finish", post(finish_hike))
        .route("/abandon", post(abandon_hike))
        .route("/favourite", post(decide_favourite))
        .route("/sos", post(send_sos))
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Request body for the favourite decision.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[schema(example = json!({ "is_favourite": true }))]
pub struct FavouriteRequest {
    /// Whether to mark the hike as a favourite.
    pub is_favourite: bool,
}

/// Outcome of a distress signal.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SosResponse {
    /// `true` when the account service confirmed the SOS.
    #[schema(example = true)]
    pub confirmed: bool,
}

async fn session_of(state: &SharedState) -> Arc<Mutex<SessionManager>> {
    Arc::clone(&state.read().await.session)
}

// ============================================================================
// Handlers
// ============================================================================

/// Get the current session.
#[utoipa::path(
    get,
    path = "/api/session",
    tag = "session",
    operation_id = "getSession",
    summary = "Get the hike session",
    description = "Returns the lifecycle state, the selected hike with its \
        route preview, elapsed time and heart rate aggregates.",
    responses(
        (status = 200, description = "Session snapshot", body = SessionSnapshot)
    )
)]
pub async fn get_session(State(state): State<SharedState>) -> Json<SessionSnapshot> {
    let session = session_of(&state).await;
    let snapshot = session.lock().await.snapshot();
    Json(snapshot)
}

/// Select a hike.
#[utoipa::path(
    post,
    path = "/api/session/select",
    tag = "session",
    operation_id = "selectHike",
    summary = "Select a hike",
    description = "Chooses the hike to do next and loads its walking route \
        from the directions service. A failed lookup leaves the route empty \
        rather than failing the request.",
    request_body = Hike,
    responses(
        (status = 200, description = "Hike selected", body = SessionSnapshot),
        (status = 409, description = "A hike is underway", body = crate::api::ErrorResponse)
    )
)]
pub async fn select_hike(
    State(state): State<SharedState>,
    Json(hike): Json<Hike>,
) -> ApiResult<Json<SessionSnapshot>> {
    let session = session_of(&state).await;
    let lookup = session.lock().await.prepare_select(hike)?;
    let (hike, route) = lookup.run().await;

    let mut session = session.lock().await;
    session.apply_select(hike, route)?;
    Ok(Json(session.snapshot()))
}

/// Start or resume.
#[utoipa::path(
    post,
    path = "/api/session/start",
    tag = "session",
    operation_id = "startHike",
    summary = "Start or resume the hike",
    description = "Starts the selected hike, or resumes a paused one. The \
        original start time is kept on resume. The alert detector window is \
        cleared so only readings from the running hike can trigger an alert.",
    responses(
        (status = 200, description = "Hike in progress", body = SessionSnapshot),
        (status = 409, description = "Nothing selected or already running", body = crate::api::ErrorResponse)
    )
)]
pub async fn start_hike(State(state): State<SharedState>) -> ApiResult<Json<SessionSnapshot>> {
    let (session, monitor) = {
        let state = state.read().await;
        (Arc::clone(&state.session), Arc::clone(&state.monitor))
    };
    let snapshot = {
        let mut session = session.lock().await;
        session.start()?;
        session.snapshot()
    };
    // Readings taken before the start must not count towards an alert.
    monitor.lock().await.reset_window();
    Ok(Json(snapshot))
}

/// Pause.
#[utoipa::path(
    post,
    path = "/api/session/pause",
    tag = "session",
    operation_id = "pauseHike",
    summary = "Pause the hike",
    responses(
        (status = 200, description = "Hike paused", body = SessionSnapshot),
        (status = 409, description = "Hike not in progress", body = crate::api::ErrorResponse)
    )
)]
pub async fn pause_hike(State(state): State<SharedState>) -> ApiResult<Json<SessionSnapshot>> {
    let session = session_of(&state).await;
    let mut session = session.lock().await;
    session.pause()?;
    Ok(Json(session.snapshot()))
}

/// Finish.
#[utoipa::path(
    post,
    path = "/api/session/finish",
    tag = "session",
    operation_id = "finishHike",
    summary = "Finish the hike",
    description = "Ends the hike and waits for the favourite decision. \
        Nothing is submitted until `/api/session/favourite` is called.",
    responses(
        (status = 200, description = "Awaiting favourite decision", body = SessionSnapshot),
        (status = 409, description = "Hike not in progress", body = crate::api::ErrorResponse)
    )
)]
pub async fn finish_hike(State(state): State<SharedState>) -> ApiResult<Json<SessionSnapshot>> {
    let session = session_of(&state).await;
    let mut session = session.lock().await;
    session.finish()?;
    Ok(Json(session.snapshot()))
}

/// Abandon.
#[utoipa::path(
    post,
    path = "/api/session/abandon",
    tag = "session",
    operation_id = "abandonHike",
    summary = "Discard the session",
    description = "Drops the selected hike and every collected reading \
        without submitting anything. Always succeeds.",
    responses(
        (status = 200, description = "Session cleared", body = SessionSnapshot)
    )
)]
pub async fn abandon_hike(State(state): State<SharedState>) -> Json<SessionSnapshot> {
    let session = session_of(&state).await;
    let mut session = session.lock().await;
    session.abandon();
    Json(session.snapshot())
}

/// Answer the favourite question and submit.
#[utoipa::path(
    post,
    path = "/api/session/favourite",
    tag = "session",
    operation_id = "decideFavourite",
    summary = "Record favourite and submit the hike",
    description = "Builds the session record (average heart rate, duration, \
        start and finish times) and sends it to the account service. The \
        session is completed either way; check `delivery` to see whether \
        the record was stored. Failed submissions are not retried.",
    request_body = FavouriteRequest,
    responses(
        (status = 200, description = "Session completed", body = SubmissionReport),
        (status = 409, description = "Hike not finished", body = crate::api::ErrorResponse)
    )
)]
pub async fn decide_favourite(
    State(state): State<SharedState>,
    Json(request): Json<FavouriteRequest>,
) -> ApiResult<Json<SubmissionReport>> {
    let session = session_of(&state).await;
    let pending = session.lock().await.prepare_submission(request.is_favourite)?;
    let (report, epoch) = pending.send().await;
    session.lock().await.record_submission(report.clone(), epoch);
    Ok(Json(report))
}

/// Send a distress signal.
#[utoipa::path(
    post,
    path = "/api/session/sos",
    tag = "session",
    operation_id = "sendSos",
    summary = "Send SOS",
    description = "Sends a distress signal with the last reported position. \
        Allowed while the hike is in progress or paused.",
    responses(
        (status = 200, description = "SOS delivered", body = SosResponse),
        (status = 409, description = "No hike underway", body = crate::api::ErrorResponse),
        (status = 424, description = "Not logged in", body = crate::api::ErrorResponse),
        (status = 502, description = "Account service unreachable or rejected the call", body = crate::api::ErrorResponse)
    )
)]
pub async fn send_sos(State(state): State<SharedState>) -> ApiResult<Json<SosResponse>> {
    let session = session_of(&state).await;
    let sos = session.lock().await.prepare_sos()?;
    let confirmed = sos.send().await?;
    Ok(Json(SosResponse { confirmed }))
}
