//! Account backend and directions service clients.
//!
//! [`Backend`] carries alerts, distress signals and finished sessions to the
//! account service; [`DirectionsProvider`] looks up walking routes. Both are
//! traits so the session manager and the alert monitor can run against the
//! recording doubles in [`RecordingBackend`] and [`StaticDirections`].

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;
use utoipa::ToSchema;

use crate::config::{BackendConfig, DirectionsConfig};
use crate::session::SessionRecord;
use crate::types::{iso_millis, GeoPoint};

/// Body the backend returns when a distress signal was relayed.
pub const SOS_CONFIRMATION: &str = "SOS sent";

/// Errors raised by the HTTP collaborators.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// A base URL could not be parsed or joined.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// No bearer token has been provided yet.
    #[error("No backend token configured")]
    MissingToken,

    /// The directions service has no API key.
    #[error("No directions API key configured")]
    MissingApiKey,

    /// The request never got a response.
    #[error("Request to {endpoint} failed: {message}")]
    Transport {
        /// Path that was called.
        endpoint: String,
        /// Underlying error text.
        message: String,
    },

    /// The service answered with a non-success status.
    #[error("{endpoint} returned HTTP {status}: {body}")]
    Status {
        /// Path that was called.
        endpoint: String,
        /// HTTP status code.
        status: u16,
        /// Response body, possibly empty.
        body: String,
    },

    /// The response body was not what was expected.
    #[error("Unexpected response from {endpoint}: {message}")]
    Decode {
        /// Path that was called.
        endpoint: String,
        /// Underlying error text.
        message: String,
    },
}

/// Result alias for backend calls.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Heart rate alert posted to `/alert/send-alert`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct AlertPayload {
    /// Human-readable description.
    #[schema(example = "Heart rate above 200 bpm")]
    pub message: String,

    /// Position at dispatch time, if known.
    pub location: Option<GeoPoint>,

    /// Dispatch time.
    #[serde(with = "iso_millis")]
    pub time: DateTime<Utc>,
}

/// Distress signal posted to `/sos/send-sos`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SosPayload {
    /// Position at dispatch time, if known.
    pub location: Option<GeoPoint>,

    /// Dispatch time.
    #[serde(with = "iso_millis")]
    pub time: DateTime<Utc>,
}

/// The account service.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Relay a heart rate alert.
    async fn send_alert(&self, alert: &AlertPayload) -> BackendResult<()>;

    /// Relay a distress signal. `Ok(true)` when the service confirmed it.
    async fn send_sos(&self, sos: &SosPayload) -> BackendResult<bool>;

    /// Store a finished session.
    async fn submit_session(&self, record: &SessionRecord) -> BackendResult<()>;

    /// Replace the bearer token, e.g. after the user logs in again.
    async fn set_token(&self, token: Option<String>);
}

/// Walking route lookup.
#[async_trait]
pub trait DirectionsProvider: Send + Sync {
    /// Encoded polyline of the first route, or `None` when there is no route.
    async fn route(&self, origin: GeoPoint, destination: GeoPoint)
        -> BackendResult<Option<String>>;
}

/// Parse `base` so relative paths join under it.
fn base_url(base: &str) -> BackendResult<Url> {
    let mut url = Url::parse(base).map_err(|e| BackendError::InvalidUrl(format!("{base}: {e}")))?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn http_client(timeout: Duration) -> BackendResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| BackendError::Transport {
            endpoint: String::new(),
            message: e.to_string(),
        })
}

// =============================================================================
// HTTP BACKEND
// =============================================================================

/// [`Backend`] over HTTP with bearer authentication.
#[derive(Debug)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: Url,
    token: RwLock<Option<String>>,
}

impl HttpBackend {
    /// Relative path for alerts.
    pub const ALERT_PATH: &'static str = "alert/send-alert";
    /// Relative path for distress signals.
    pub const SOS_PATH: &'static str = "sos/send-sos";
    /// Relative path for finished sessions.
    pub const FINISH_PATH: &'static str = "hike/finish-hike";

    /// Build a client from the `[backend]` section.
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL is invalid or the HTTP client cannot
    /// be built.
    pub fn new(config: &BackendConfig) -> BackendResult<Self> {
        Ok(Self {
            client: http_client(Duration::from_secs(config.timeout_secs))?,
            base_url: base_url(&config.base_url)?,
            token: RwLock::new(config.token.clone()),
        })
    }

    /// Whether a bearer token is present.
    pub async fn has_token(&self) -> bool {
        self.token.read().await.is_some()
    }

    async fn post<T: Serialize + Sync>(&self, path: &str, body: &T) -> BackendResult<String> {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| BackendError::InvalidUrl(e.to_string()))?;
        let token = self
            .token
            .read()
            .await
            .clone()
            .ok_or(BackendError::MissingToken)?;

        debug!(endpoint = path, "Posting to backend");
        let response = self
            .client
            .post(url)
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .map_err(|e| BackendError::Transport {
                endpoint: path.to_string(),
                message: e.to_string(),
            })?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            warn!(endpoint = path, status = status.as_u16(), "Backend rejected request");
            return Err(BackendError::Status {
                endpoint: path.to_string(),
                status: status.as_u16(),
                body: text,
            });
        }
        Ok(text)
    }
}

/// Whether a response body is the SOS confirmation, as plain text or a JSON
/// string.
fn is_sos_confirmation(body: &str) -> bool {
    let body = body.trim();
    body == SOS_CONFIRMATION
        || serde_json::from_str::<String>(body).is_ok_and(|s| s == SOS_CONFIRMATION)
}

#[async_trait]
impl Backend for HttpBackend {
    async fn send_alert(&self, alert: &AlertPayload) -> BackendResult<()> {
        self.post(Self::ALERT_PATH, alert).await?;
        info!(message = %alert.message, "Alert sent");
        Ok(())
    }

    async fn send_sos(&self, sos: &SosPayload) -> BackendResult<bool> {
        let body = self.post(Self::SOS_PATH, sos).await?;
        let confirmed = is_sos_confirmation(&body);
        if confirmed {
            info!("SOS sent");
        } else {
            warn!(body = %body, "SOS not confirmed by backend");
        }
        Ok(confirmed)
    }

    async fn submit_session(&self, record: &SessionRecord) -> BackendResult<()> {
        self.post(Self::FINISH_PATH, record).await?;
        info!(hike = %record.hike.name, "Hike session submitted");
        Ok(())
    }

    async fn set_token(&self, token: Option<String>) {
        debug!(present = token.is_some(), "Backend token replaced");
        *self.token.write().await = token;
    }
}

// =============================================================================
// DIRECTIONS
// =============================================================================

#[derive(Debug, Deserialize)]
struct DirectionsResponse {
    #[serde(default)]
    routes: Vec<DirectionsRoute>,
}

#[derive(Debug, Deserialize)]
struct DirectionsRoute {
    overview_polyline: OverviewPolyline,
}

#[derive(Debug, Deserialize)]
struct OverviewPolyline {
    points: String,
}

/// [`DirectionsProvider`] backed by the Google Directions API.
#[derive(Debug)]
pub struct GoogleDirections {
    client: reqwest::Client,
    base_url: Url,
    api_key: String,
    mode: String,
}

impl GoogleDirections {
    /// Relative path of the JSON endpoint.
    pub const DIRECTIONS_PATH: &'static str = "maps/api/directions/json";

    /// Build a client from the `[directions]` section.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::MissingApiKey`] without a key, or an error if
    /// the base URL is invalid.
    pub fn new(config: &DirectionsConfig, timeout: Duration) -> BackendResult<Self> {
        let api_key = config.api_key.clone().ok_or(BackendError::MissingApiKey)?;
        Ok(Self {
            client: http_client(timeout)?,
            base_url: base_url(&config.base_url)?,
            api_key,
            mode: config.mode.clone(),
        })
    }
}

#[async_trait]
impl DirectionsProvider for GoogleDirections {
    async fn route(
        &self,
        origin: GeoPoint,
        destination: GeoPoint,
    ) -> BackendResult<Option<String>> {
        let endpoint = Self::DIRECTIONS_PATH;
        let url = self
            .base_url
            .join(endpoint)
            .map_err(|e| BackendError::InvalidUrl(e.to_string()))?;

        let response = self
            .client
            .get(url)
            .query(&[
                ("origin", origin.to_query_pair()),
                ("destination", destination.to_query_pair()),
                ("mode", self.mode.clone()),
                ("key", self.api_key.clone()),
            ])
            .send()
            .await
            .map_err(|e| BackendError::Transport {
                endpoint: endpoint.to_string(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Status {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let body: DirectionsResponse =
            response.json().await.map_err(|e| BackendError::Decode {
                endpoint: endpoint.to_string(),
                message: e.to_string(),
            })?;
        Ok(body
            .routes
            .into_iter()
            .next()
            .map(|route| route.overview_polyline.points))
    }
}

// =============================================================================
// RECORDING DOUBLES
// =============================================================================

#[derive(Debug, Default)]
struct Recorded {
    alerts: Vec<AlertPayload>,
    sos: Vec<SosPayload>,
    sessions: Vec<SessionRecord>,
    token: Option<String>,
    fail_with: Option<BackendError>,
    confirm_sos: bool,
    stalled: bool,
}

/// In-memory [`Backend`] that records every call.
#[derive(Debug)]
pub struct RecordingBackend {
    inner: Mutex<Recorded>,
}

impl Default for RecordingBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingBackend {
    /// Accepts everything and confirms SOS.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Recorded {
                confirm_sos: true,
                ..Recorded::default()
            }),
        }
    }

    /// Fail every later call with `error` (still recording the payload).
    pub fn fail_with(&self, error: Option<BackendError>) {
        self.lock().fail_with = error;
    }

    /// Record later calls but never answer them, like a service that
    /// accepted the connection and went quiet.
    pub fn stall(&self, stalled: bool) {
        self.lock().stalled = stalled;
    }

    /// Whether SOS calls answer with the confirmation body.
    pub fn confirm_sos(&self, confirm: bool) {
        self.lock().confirm_sos = confirm;
    }

    /// Alerts received so far.
    #[must_use]
    pub fn alerts(&self) -> Vec<AlertPayload> {
        self.lock().alerts.clone()
    }

    /// Distress signals received so far.
    #[must_use]
    pub fn sos_calls(&self) -> Vec<SosPayload> {
        self.lock().sos.clone()
    }

    /// Sessions received so far.
    #[must_use]
    pub fn sessions(&self) -> Vec<SessionRecord> {
        self.lock().sessions.clone()
    }

    /// Last token handed over.
    #[must_use]
    pub fn token(&self) -> Option<String> {
        self.lock().token.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Recorded> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Backend for RecordingBackend {
    async fn send_alert(&self, alert: &AlertPayload) -> BackendResult<()> {
        let (stalled, result) = {
            let mut inner = self.lock();
            inner.alerts.push(alert.clone());
            (inner.stalled, inner.fail_with.clone().map_or(Ok(()), Err))
        };
        hold_if(stalled).await;
        result
    }

    async fn send_sos(&self, sos: &SosPayload) -> BackendResult<bool> {
        let (stalled, result) = {
            let mut inner = self.lock();
            inner.sos.push(sos.clone());
            let confirmed = inner.confirm_sos;
            (inner.stalled, inner.fail_with.clone().map_or(Ok(confirmed), Err))
        };
        hold_if(stalled).await;
        result
    }

    async fn submit_session(&self, record: &SessionRecord) -> BackendResult<()> {
        let (stalled, result) = {
            let mut inner = self.lock();
            inner.sessions.push(record.clone());
            (inner.stalled, inner.fail_with.clone().map_or(Ok(()), Err))
        };
        hold_if(stalled).await;
        result
    }

    async fn set_token(&self, token: Option<String>) {
        self.lock().token = token;
    }
}

async fn hold_if(stalled: bool) {
    if stalled {
        std::future::pending::<()>().await;
    }
}

/// [`DirectionsProvider`] with a canned answer.
#[derive(Debug, Clone)]
pub struct StaticDirections {
    answer: BackendResult<Option<String>>,
}

impl StaticDirections {
    /// Always return `encoded`.
    #[must_use]
    pub fn route(encoded: &str) -> Self {
        Self {
            answer: Ok(Some(encoded.to_string())),
        }
    }

    /// Always report that no route exists.
    #[must_use]
    pub const fn no_route() -> Self {
        Self { answer: Ok(None) }
    }

    /// Always fail with `error`.
    #[must_use]
    pub const fn failing(error: BackendError) -> Self {
        Self { answer: Err(error) }
    }
}

#[async_trait]
impl DirectionsProvider for StaticDirections {
    async fn route(&self, _origin: GeoPoint, _destination: GeoPoint) -> BackendResult<Option<String>> {
        self.answer.clone()
    }
}
