//! Hike session lifecycle.
//!
//! A session moves through
//!
//! ```text
//! NoSelection -> Selected -> InProgress <-> Paused
//!                            InProgress -> AwaitingFavoriteDecision -> Completed
//! ```
//!
//! Readings are appended to a window that is cleared whenever the hike is
//! started or resumed. Pausing or finishing folds the window into the
//! collected readings, which the final average is computed from. Completing
//! the favourite decision submits the session exactly once; the outcome of
//! that submission never moves the session back.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use crate::backend::{Backend, BackendError, DirectionsProvider, SosPayload};
use crate::clock::Clock;
use crate::location::LocationProvider;
use crate::polyline;
use crate::types::{iso_millis, GeoPoint, Hike, Reading};

/// Hike fields that the submitted record sets itself.
const RECORD_FIELDS: [&str; 6] = [
    "avgHeartRate",
    "duration",
    "startTime",
    "finishTime",
    "completed",
    "isFavourite",
];

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No hike chosen.
    NoSelection,
    /// Hike chosen, route preview available.
    Selected,
    /// Hike underway.
    InProgress,
    /// Hike paused.
    Paused,
    /// Hike finished, waiting for the favourite answer.
    AwaitingFavoriteDecision,
    /// Record submitted (or submission attempted).
    Completed,
}

impl SessionState {
    /// Snake-case name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NoSelection => "no_selection",
            Self::Selected => "selected",
            Self::InProgress => "in_progress",
            Self::Paused => "paused",
            Self::AwaitingFavoriteDecision => "awaiting_favorite_decision",
            Self::Completed => "completed",
        }
    }

    /// Whether the hike has been started and not yet finished.
    #[must_use]
    pub const fn is_underway(&self) -> bool {
        matches!(self, Self::InProgress | Self::Paused)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operations that drive the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SessionAction {
    /// Choose a hike.
    Select,
    /// Start or resume.
    Start,
    /// Pause.
    Pause,
    /// Finish.
    Finish,
    /// Answer the favourite prompt.
    DecideFavorite,
    /// Send a distress signal.
    SendSos,
}

impl fmt::Display for SessionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Select => "select",
            Self::Start => "start",
            Self::Pause => "pause",
            Self::Finish => "finish",
            Self::DecideFavorite => "decide_favorite",
            Self::SendSos => "send_sos",
        })
    }
}

/// Errors raised by the session manager.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    /// The action is not allowed in the current state.
    #[error("Cannot {action} while session is {from}")]
    InvalidTransition {
        /// State the session was in.
        from: SessionState,
        /// Rejected action.
        action: SessionAction,
    },

    /// The distress signal could not be delivered.
    #[error("Failed to send SOS: {0}")]
    Sos(#[from] BackendError),
}

/// Result alias for session operations.
pub type SessionResult<T> = std::result::Result<T, SessionError>;

/// The finished session as submitted to the backend.
///
/// The hike descriptor's own fields are emitted alongside the computed ones
/// in a single flat JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    /// The selected hike, prior alerts normalized.
    #[serde(flatten)]
    pub hike: Hike,

    /// Mean of all collected readings, 0 if there were none.
    #[schema(example = 128.4)]
    pub avg_heart_rate: f64,

    /// Completion time minus original start time, in milliseconds.
    #[schema(example = 5_400_000)]
    pub duration: i64,

    /// First start.
    #[serde(with = "iso_millis")]
    pub start_time: DateTime<Utc>,

    /// Completion.
    #[serde(with = "iso_millis")]
    pub finish_time: DateTime<Utc>,

    /// Always `true` for a submitted record.
    pub completed: bool,

    /// The user's favourite answer.
    pub is_favourite: bool,
}

/// Whether the backend took the record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Delivery {
    /// Stored by the backend.
    Accepted,
    /// Not stored; not retried.
    Failed {
        /// Backend error text.
        error: String,
    },
}

/// Result of the favourite decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SubmissionReport {
    /// The record that was sent.
    pub record: SessionRecord,
    /// What happened to it.
    pub delivery: Delivery,
}

/// Serializable view of the session.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    /// Lifecycle state.
    pub state: SessionState,
    /// Selected hike.
    pub hike: Option<Hike>,
    /// Route preview.
    pub route: Vec<GeoPoint>,
    /// First start.
    pub started_at: Option<DateTime<Utc>>,
    /// Milliseconds since first start.
    pub elapsed_ms: Option<i64>,
    /// Readings folded into the aggregate.
    pub collected_readings: usize,
    /// Readings in the current window.
    pub window_readings: usize,
    /// Mean of collected readings.
    pub average_heart_rate: f64,
    /// Outcome of the submission, once completed.
    pub submission: Option<SubmissionReport>,
}

/// Mean of `readings`, 0 when empty.
#[must_use]
pub fn average_bpm(readings: &[Reading]) -> f64 {
    if readings.is_empty() {
        return 0.0;
    }
    let total: u64 = readings.iter().map(|r| u64::from(r.bpm)).sum();
    #[allow(clippy::cast_precision_loss)]
    let mean = total as f64 / readings.len() as f64;
    mean
}

/// One hike session and its collaborators.
pub struct SessionManager {
    directions: Arc<dyn DirectionsProvider>,
    backend: Arc<dyn Backend>,
    location: Arc<dyn LocationProvider>,
    clock: Arc<dyn Clock>,
    state: SessionState,
    hike: Option<Hike>,
    route: Vec<GeoPoint>,
    started_at: Option<DateTime<Utc>>,
    window: Vec<Reading>,
    collected: Vec<Reading>,
    submission: Option<SubmissionReport>,
    epoch: u64,
}

/// Route lookup for a hike being selected, run without the session.
pub struct RouteLookup {
    directions: Arc<dyn DirectionsProvider>,
    hike: Hike,
}

impl RouteLookup {
    /// Fetch and decode the walking route. Failures give an empty route.
    pub async fn run(self) -> (Hike, Vec<GeoPoint>) {
        let hike = self.hike;
        let route = match self
            .directions
            .route(hike.start_location, hike.finish_location)
            .await
        {
            Ok(Some(encoded)) => polyline::decode(&encoded).unwrap_or_else(|e| {
                warn!(hike = %hike.name, error = %e, "Route polyline could not be decoded");
                Vec::new()
            }),
            Ok(None) => {
                info!(hike = %hike.name, "No route found");
                Vec::new()
            }
            Err(e) => {
                warn!(hike = %hike.name, error = %e, "Error fetching directions");
                Vec::new()
            }
        };
        (hike, route)
    }
}

/// A built session record waiting to be sent.
pub struct PendingSubmission {
    record: SessionRecord,
    backend: Arc<dyn Backend>,
    epoch: u64,
}

impl PendingSubmission {
    /// The record that will be sent.
    #[must_use]
    pub const fn record(&self) -> &SessionRecord {
        &self.record
    }

    /// Submit the record once. Failures are reported, not retried.
    pub async fn send(self) -> (SubmissionReport, u64) {
        let record = self.record;
        let delivery = match self.backend.submit_session(&record).await {
            Ok(()) => Delivery::Accepted,
            Err(e) => {
                warn!(hike = %record.hike.name, error = %e, "Error sending hike");
                Delivery::Failed {
                    error: e.to_string(),
                }
            }
        };
        info!(
            hike = %record.hike.name,
            avg_heart_rate = record.avg_heart_rate,
            duration_ms = record.duration,
            is_favourite = record.is_favourite,
            accepted = matches!(delivery, Delivery::Accepted),
            "Hike completed"
        );
        (SubmissionReport { record, delivery }, self.epoch)
    }
}

/// A distress signal checked against the session, sent without it.
pub struct PendingSos {
    backend: Arc<dyn Backend>,
    location: Arc<dyn LocationProvider>,
    clock: Arc<dyn Clock>,
}

impl PendingSos {
    /// Deliver the signal with the best-known position.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Sos`] if delivery failed.
    pub async fn send(self) -> SessionResult<bool> {
        let sos = SosPayload {
            location: self.location.current_position().await,
            time: self.clock.now(),
        };
        warn!(has_location = sos.location.is_some(), "Sending SOS");
        Ok(self.backend.send_sos(&sos).await?)
    }
}

impl SessionManager {
    /// Create a manager with nothing selected.
    pub fn new(
        directions: Arc<dyn DirectionsProvider>,
        backend: Arc<dyn Backend>,
        location: Arc<dyn LocationProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            directions,
            backend,
            location,
            clock,
            state: SessionState::NoSelection,
            hike: None,
            route: Vec::new(),
            started_at: None,
            window: Vec::new(),
            collected: Vec::new(),
            submission: None,
            epoch: 0,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Route preview of the selected hike.
    #[must_use]
    pub fn route(&self) -> &[GeoPoint] {
        &self.route
    }

    fn ensure(&self, action: SessionAction, allowed: &[SessionState]) -> SessionResult<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(SessionError::InvalidTransition {
                from: self.state,
                action,
            })
        }
    }

    fn transition(&mut self, next: SessionState) {
        debug!(from = %self.state, to = %next, "Session state changed");
        self.state = next;
    }

    /// Choose a hike and load its route preview.
    ///
    /// A failed lookup or an undecodable route leaves the preview empty.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidTransition`] while a hike is underway
    /// or awaiting the favourite decision.
    pub async fn select(&mut self, hike: Hike) -> SessionResult<&[GeoPoint]> {
        let (hike, route) = self.prepare_select(hike)?.run().await;
        self.apply_select(hike, route)
    }

    const SELECTABLE: [SessionState; 3] = [
        SessionState::NoSelection,
        SessionState::Selected,
        SessionState::Completed,
    ];

    /// Check that a hike may be selected and hand out the route lookup.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidTransition`] while a hike is underway
    /// or awaiting the favourite decision.
    pub fn prepare_select(&self, hike: Hike) -> SessionResult<RouteLookup> {
        self.ensure(SessionAction::Select, &Self::SELECTABLE)?;
        Ok(RouteLookup {
            directions: Arc::clone(&self.directions),
            hike,
        })
    }

    /// Install a hike and the route fetched by [`RouteLookup::run`].
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidTransition`] if a hike was started
    /// while the route was being fetched.
    pub fn apply_select(&mut self, hike: Hike, route: Vec<GeoPoint>) -> SessionResult<&[GeoPoint]> {
        self.ensure(SessionAction::Select, &Self::SELECTABLE)?;
        info!(hike = %hike.name, points = route.len(), "Hike selected");

        self.epoch = self.epoch.wrapping_add(1);
        self.hike = Some(hike);
        self.route = route;
        self.started_at = None;
        self.window.clear();
        self.collected.clear();
        self.submission = None;
        self.transition(SessionState::Selected);
        Ok(&self.route)
    }

    /// Start or resume the hike.
    ///
    /// Clears the reading window. The start time is recorded on the first
    /// start only.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidTransition`] unless selected or paused.
    pub fn start(&mut self) -> SessionResult<DateTime<Utc>> {
        self.ensure(
            SessionAction::Start,
            &[SessionState::Selected, SessionState::Paused],
        )?;
        self.window.clear();
        let started_at = *self.started_at.get_or_insert_with(|| self.clock.now());
        info!(%started_at, resumed = self.state == SessionState::Paused, "Hike started");
        self.transition(SessionState::InProgress);
        Ok(started_at)
    }

    /// Append a reading to the window.
    pub fn record(&mut self, reading: Reading) {
        self.window.push(reading);
    }

    /// Pause the hike, folding the window into the collected readings.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidTransition`] unless in progress.
    pub fn pause(&mut self) -> SessionResult<()> {
        self.ensure(SessionAction::Pause, &[SessionState::InProgress])?;
        self.fold_window();
        info!(collected = self.collected.len(), "Hike paused");
        self.transition(SessionState::Paused);
        Ok(())
    }

    /// Finish the hike and wait for the favourite answer. Nothing is
    /// submitted yet.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidTransition`] unless in progress.
    pub fn finish(&mut self) -> SessionResult<()> {
        self.ensure(SessionAction::Finish, &[SessionState::InProgress])?;
        self.fold_window();
        info!(collected = self.collected.len(), "Hike finished");
        self.transition(SessionState::AwaitingFavoriteDecision);
        Ok(())
    }

    fn fold_window(&mut self) {
        self.collected.append(&mut self.window);
    }

    /// Record the favourite answer, build the session record and submit it.
    ///
    /// The session is `Completed` afterwards whether or not the backend
    /// accepted the record.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidTransition`] unless awaiting the
    /// decision.
    pub async fn decide_favorite(&mut self, is_favourite: bool) -> SessionResult<SubmissionReport> {
        let (report, epoch) = self.prepare_submission(is_favourite)?.send().await;
        self.record_submission(report.clone(), epoch);
        Ok(report)
    }

    /// Record the favourite answer and build the session record.
    ///
    /// The session is `Completed` as soon as this returns, so the record is
    /// handed out exactly once.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidTransition`] unless awaiting the
    /// decision.
    pub fn prepare_submission(&mut self, is_favourite: bool) -> SessionResult<PendingSubmission> {
        self.ensure(
            SessionAction::DecideFavorite,
            &[SessionState::AwaitingFavoriteDecision],
        )?;
        let (Some(hike), Some(start_time)) = (self.hike.clone(), self.started_at) else {
            return Err(SessionError::InvalidTransition {
                from: self.state,
                action: SessionAction::DecideFavorite,
            });
        };

        let finish_time = self.clock.now();
        let mut hike = hike;
        for field in RECORD_FIELDS {
            hike.extra.remove(field);
        }
        let record = SessionRecord {
            hike,
            avg_heart_rate: average_bpm(&self.collected),
            duration: (finish_time - start_time).num_milliseconds(),
            start_time,
            finish_time,
            completed: true,
            is_favourite,
        };
        self.transition(SessionState::Completed);

        Ok(PendingSubmission {
            record,
            backend: Arc::clone(&self.backend),
            epoch: self.epoch,
        })
    }

    /// Keep the outcome of [`PendingSubmission::send`] for the snapshot.
    ///
    /// Ignored if the session moved on to another hike in the meantime.
    pub fn record_submission(&mut self, report: SubmissionReport, epoch: u64) {
        if epoch == self.epoch && self.state == SessionState::Completed {
            self.submission = Some(report);
        } else {
            debug!("Session changed while submitting, outcome not kept");
        }
    }

    /// Send a distress signal with the best-known position.
    ///
    /// Returns whether the backend confirmed it. The session state is not
    /// affected.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidTransition`] unless the hike is
    /// underway, or [`SessionError::Sos`] if delivery failed.
    pub async fn send_sos(&self) -> SessionResult<bool> {
        self.prepare_sos()?.send().await
    }

    /// Check that a distress signal is allowed now.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidTransition`] unless the hike is
    /// underway.
    pub fn prepare_sos(&self) -> SessionResult<PendingSos> {
        self.ensure(
            SessionAction::SendSos,
            &[SessionState::InProgress, SessionState::Paused],
        )?;
        Ok(PendingSos {
            backend: Arc::clone(&self.backend),
            location: Arc::clone(&self.location),
            clock: Arc::clone(&self.clock),
        })
    }

    /// Discard the session without submitting.
    pub fn abandon(&mut self) {
        if self.state != SessionState::NoSelection {
            info!(state = %self.state, "Session abandoned");
        }
        self.epoch = self.epoch.wrapping_add(1);
        self.hike = None;
        self.route.clear();
        self.started_at = None;
        self.window.clear();
        self.collected.clear();
        self.submission = None;
        self.transition(SessionState::NoSelection);
    }

    /// Current view of the session.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        let elapsed_ms = self.started_at.map(|start| {
            let end = self
                .submission
                .as_ref()
                .map_or_else(|| self.clock.now(), |s| s.record.finish_time);
            (end - start).num_milliseconds()
        });
        SessionSnapshot {
            state: self.state,
            hike: self.hike.clone(),
            route: self.route.clone(),
            started_at: self.started_at,
            elapsed_ms,
            collected_readings: self.collected.len(),
            window_readings: self.window.len(),
            average_heart_rate: average_bpm(&self.collected),
            submission: self.submission.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{RecordingBackend, StaticDirections};
    use crate::clock::ManualClock;
    use crate::location::FixedLocation;
    use crate::types::HikeAlert;
    use chrono::TimeZone;

    const ROUTE: &str = "_p~iF~ps|U_ulLnnqC_mqNvxq`@";

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap()
    }

    fn hike() -> Hike {
        Hike::new(
            "Skyline Trail",
            GeoPoint::new(46.786, -121.7355),
            GeoPoint::new(46.8052, -121.7247),
        )
    }

    struct Fixture {
        session: SessionManager,
        backend: Arc<RecordingBackend>,
        clock: Arc<ManualClock>,
    }

    fn fixture(directions: StaticDirections) -> Fixture {
        let backend = Arc::new(RecordingBackend::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let session = SessionManager::new(
            Arc::new(directions),
            Arc::clone(&backend) as Arc<dyn Backend>,
            Arc::new(FixedLocation(Some(GeoPoint::new(46.79, -121.73)))),
            Arc::clone(&clock) as Arc<dyn Clock>,
        );
        Fixture {
            session,
            backend,
            clock,
        }
    }

    impl Fixture {
        fn feed(&mut self, values: &[u16]) {
            for &bpm in values {
                self.session.record(Reading::new(bpm, self.clock.now()));
            }
        }
    }

    #[test]
    fn test_average() {
        assert!((average_bpm(&[]) - 0.0).abs() < f64::EPSILON);
        let readings: Vec<_> = [60, 80, 100].iter().map(|&b| Reading::new(b, t0())).collect();
        assert!((average_bpm(&readings) - 80.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_select_decodes_route() {
        let mut f = fixture(StaticDirections::route(ROUTE));
        let route = f.session.select(hike()).await.unwrap();
        assert_eq!(route.len(), 3);
        assert_eq!(f.session.state(), SessionState::Selected);
    }

    #[tokio::test]
    async fn test_select_tolerates_directions_failure() {
        let mut f = fixture(StaticDirections::failing(BackendError::MissingApiKey));
        assert!(f.session.select(hike()).await.unwrap().is_empty());
        assert_eq!(f.session.state(), SessionState::Selected);

        let mut f = fixture(StaticDirections::route("_p~iF"));
        assert!(f.session.select(hike()).await.unwrap().is_empty());

        let mut f = fixture(StaticDirections::no_route());
        assert!(f.session.select(hike()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resume_keeps_original_start() {
        let mut f = fixture(StaticDirections::no_route());
        f.session.select(hike()).await.unwrap();

        let first = f.session.start().unwrap();
        f.clock.advance_millis(60_000);
        f.session.pause().unwrap();
        f.clock.advance_millis(30_000);
        let resumed = f.session.start().unwrap();
        assert_eq!(first, resumed);
        assert_eq!(first, t0());

        f.clock.advance_millis(10_000);
        f.session.finish().unwrap();
        let report = f.session.decide_favorite(false).await.unwrap();
        assert_eq!(report.record.duration, 100_000);
        assert_eq!(report.record.start_time, t0());
    }

    #[tokio::test]
    async fn test_resume_discards_readings_taken_while_paused() {
        let mut f = fixture(StaticDirections::no_route());
        f.session.select(hike()).await.unwrap();
        f.session.start().unwrap();
        f.feed(&[60, 80]);
        f.session.pause().unwrap();
        f.feed(&[150]);
        f.session.start().unwrap();
        f.feed(&[100]);
        f.session.finish().unwrap();

        let report = f.session.decide_favorite(true).await.unwrap();
        assert!((report.record.avg_heart_rate - 80.0).abs() < f64::EPSILON);
        assert!(report.record.is_favourite);
        assert!(report.record.completed);
        assert_eq!(report.delivery, Delivery::Accepted);
        assert_eq!(f.backend.sessions().len(), 1);
        assert_eq!(f.session.state(), SessionState::Completed);
    }

    #[tokio::test]
    async fn test_empty_session_averages_zero() {
        let mut f = fixture(StaticDirections::no_route());
        f.session.select(hike()).await.unwrap();
        f.session.start().unwrap();
        f.session.finish().unwrap();
        let report = f.session.decide_favorite(false).await.unwrap();
        assert!((report.record.avg_heart_rate).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_submission_failure_still_completes() {
        let mut f = fixture(StaticDirections::no_route());
        f.backend.fail_with(Some(BackendError::Status {
            endpoint: "hike/finish-hike".to_string(),
            status: 500,
            body: String::new(),
        }));
        f.session.select(hike()).await.unwrap();
        f.session.start().unwrap();
        f.session.finish().unwrap();

        let report = f.session.decide_favorite(false).await.unwrap();
        assert!(matches!(report.delivery, Delivery::Failed { .. }));
        assert_eq!(f.session.state(), SessionState::Completed);

        // At most once: no second submission and no way back.
        assert!(f.session.decide_favorite(true).await.is_err());
        assert!(f.session.start().is_err());
        assert_eq!(f.backend.sessions().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_transitions() {
        let mut f = fixture(StaticDirections::no_route());
        assert!(matches!(
            f.session.start(),
            Err(SessionError::InvalidTransition {
                from: SessionState::NoSelection,
                action: SessionAction::Start
            })
        ));
        assert!(f.session.pause().is_err());
        assert!(f.session.finish().is_err());

        f.session.select(hike()).await.unwrap();
        f.session.start().unwrap();
        assert!(matches!(
            f.session.select(hike()).await,
            Err(SessionError::InvalidTransition {
                action: SessionAction::Select,
                ..
            })
        ));

        f.session.pause().unwrap();
        assert!(f.session.finish().is_err());
    }

    #[tokio::test]
    async fn test_sos_only_while_underway() {
        let mut f = fixture(StaticDirections::no_route());
        assert!(f.session.send_sos().await.is_err());

        f.session.select(hike()).await.unwrap();
        f.session.start().unwrap();
        assert!(f.session.send_sos().await.unwrap());

        f.session.pause().unwrap();
        f.backend.confirm_sos(false);
        assert!(!f.session.send_sos().await.unwrap());
        assert_eq!(f.session.state(), SessionState::Paused);

        let calls = f.backend.sos_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].location, Some(GeoPoint::new(46.79, -121.73)));
    }

    #[tokio::test]
    async fn test_sos_failure_surfaces() {
        let mut f = fixture(StaticDirections::no_route());
        f.session.select(hike()).await.unwrap();
        f.session.start().unwrap();
        f.backend.fail_with(Some(BackendError::MissingToken));
        assert!(matches!(
            f.session.send_sos().await,
            Err(SessionError::Sos(BackendError::MissingToken))
        ));
        assert_eq!(f.session.state(), SessionState::InProgress);
    }

    #[tokio::test]
    async fn test_record_shape() {
        let mut f = fixture(StaticDirections::no_route());
        let mut selected = hike();
        selected.alerts.push(HikeAlert {
            alert_type: "heartRate".to_string(),
            information: "Heart rate above 200 bpm".to_string(),
            time: Utc.timestamp_millis_opt(1_717_233_300_000).unwrap(),
            location: None,
        });
        selected
            .extra
            .insert("distance".to_string(), serde_json::json!(8.9));
        selected
            .extra
            .insert("duration".to_string(), serde_json::json!(1));

        f.session.select(selected).await.unwrap();
        f.session.start().unwrap();
        f.clock.advance_millis(5_400_000);
        f.session.finish().unwrap();
        let report = f.session.decide_favorite(true).await.unwrap();

        let json = serde_json::to_value(&report.record).unwrap();
        assert_eq!(json["name"], "Skyline Trail");
        assert_eq!(json["distance"], 8.9);
        assert_eq!(json["duration"], 5_400_000);
        assert_eq!(json["startTime"], "2025-06-01T08:00:00.000Z");
        assert_eq!(json["finishTime"], "2025-06-01T09:30:00.000Z");
        assert_eq!(json["alerts"][0]["time"], "2024-06-01T09:15:00.000Z");
        assert_eq!(json["completed"], true);
        assert_eq!(json["isFavourite"], true);
        assert_eq!(json["avgHeartRate"], 0.0);
    }

    #[tokio::test]
    async fn test_abandon_from_any_state() {
        let mut f = fixture(StaticDirections::route(ROUTE));
        f.session.select(hike()).await.unwrap();
        f.session.start().unwrap();
        f.feed(&[90]);
        f.session.abandon();

        let snapshot = f.session.snapshot();
        assert_eq!(snapshot.state, SessionState::NoSelection);
        assert!(snapshot.hike.is_none());
        assert!(snapshot.route.is_empty());
        assert!(f.backend.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_tracks_progress() {
        let mut f = fixture(StaticDirections::no_route());
        f.session.select(hike()).await.unwrap();
        f.session.start().unwrap();
        f.feed(&[70, 90]);
        f.clock.advance_millis(2_000);

        let snapshot = f.session.snapshot();
        assert_eq!(snapshot.state, SessionState::InProgress);
        assert_eq!(snapshot.window_readings, 2);
        assert_eq!(snapshot.collected_readings, 0);
        assert_eq!(snapshot.elapsed_ms, Some(2_000));

        f.session.pause().unwrap();
        let snapshot = f.session.snapshot();
        assert_eq!(snapshot.collected_readings, 2);
        assert!((snapshot.average_heart_rate - 80.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_sos_is_sent_without_the_session() {
        let mut f = fixture(StaticDirections::no_route());
        f.session.select(hike()).await.unwrap();
        f.session.start().unwrap();

        let sos = f.session.prepare_sos().unwrap();
        f.feed(&[95]);
        f.session.pause().unwrap();
        assert!(sos.send().await.unwrap());

        assert_eq!(f.backend.sos_calls().len(), 1);
        assert_eq!(f.session.state(), SessionState::Paused);
    }

    #[tokio::test]
    async fn test_submission_is_handed_out_once() {
        let mut f = fixture(StaticDirections::no_route());
        f.session.select(hike()).await.unwrap();
        f.session.start().unwrap();
        f.session.finish().unwrap();

        let pending = f.session.prepare_submission(true).unwrap();
        assert_eq!(f.session.state(), SessionState::Completed);
        assert!(matches!(
            f.session.prepare_submission(false),
            Err(SessionError::InvalidTransition { .. })
        ));

        let (report, epoch) = pending.send().await;
        f.session.record_submission(report.clone(), epoch);
        assert_eq!(f.session.snapshot().submission, Some(report));
        assert_eq!(f.backend.sessions().len(), 1);
    }

    #[tokio::test]
    async fn test_late_submission_outcome_is_dropped_after_abandon() {
        let mut f = fixture(StaticDirections::no_route());
        f.session.select(hike()).await.unwrap();
        f.session.start().unwrap();
        f.session.finish().unwrap();

        let pending = f.session.prepare_submission(false).unwrap();
        f.session.abandon();
        let (report, epoch) = pending.send().await;
        f.session.record_submission(report, epoch);

        assert!(f.session.snapshot().submission.is_none());
        assert_eq!(f.session.state(), SessionState::NoSelection);
    }

    #[tokio::test]
    async fn test_route_lookup_loses_to_a_start() {
        let mut f = fixture(StaticDirections::route(ROUTE));
        f.session.select(hike()).await.unwrap();

        let lookup = f.session.prepare_select(hike()).unwrap();
        f.session.start().unwrap();
        let (next, route) = lookup.run().await;
        assert_eq!(route.len(), 3);
        assert!(matches!(
            f.session.apply_select(next, route),
            Err(SessionError::InvalidTransition {
                from: SessionState::InProgress,
                action: SessionAction::Select
            })
        ));
    }
}
