//! Application state shared across handlers.

use std::sync::Arc;

use hikesense_core::backend::{BackendError, StaticDirections};
use hikesense_core::bluetooth::{
    AlwaysGranted, BleTransport, DeviceLink, LinkState, LinkStatus, PermissionGate, ScanCanceller,
};
use hikesense_core::{
    AlertMonitor, Backend, Clock, DirectionsProvider, GoogleDirections, HikeSenseConfig,
    HttpBackend, PipelineSummary, Reading, ReportedLocation, SessionManager, SystemClock,
};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Shared application state handle.
pub type SharedState = Arc<RwLock<AppState>>;

/// External collaborators the daemon is wired to.
pub struct Services {
    /// Radio, or `None` when no adapter could be opened.
    pub transport: Option<Arc<dyn BleTransport>>,
    /// Platform permission prompt.
    pub permissions: Arc<dyn PermissionGate>,
    /// Account service.
    pub backend: Arc<dyn Backend>,
    /// Route lookup.
    pub directions: Arc<dyn DirectionsProvider>,
    /// Wall clock.
    pub clock: Arc<dyn Clock>,
}

impl Services {
    /// HTTP clients built from `config` around the given radio.
    ///
    /// Without a directions API key every route lookup fails and hikes are
    /// selected with an empty preview.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend client cannot be built.
    pub fn from_config(
        config: &HikeSenseConfig,
        transport: Option<Arc<dyn BleTransport>>,
    ) -> anyhow::Result<Self> {
        let backend = HttpBackend::new(&config.backend)?;
        let timeout = std::time::Duration::from_secs(config.backend.timeout_secs);
        let directions: Arc<dyn DirectionsProvider> =
            match GoogleDirections::new(&config.directions, timeout) {
                Ok(directions) => Arc::new(directions),
                Err(BackendError::MissingApiKey) => {
                    warn!("No directions API key configured; routes will be empty");
                    Arc::new(StaticDirections::failing(BackendError::MissingApiKey))
                }
                Err(e) => return Err(e.into()),
            };

        Ok(Self {
            transport,
            permissions: Arc::new(AlwaysGranted),
            backend: Arc::new(backend),
            directions,
            clock: Arc::new(SystemClock),
        })
    }
}

/// Everything the handlers operate on.
pub struct AppState {
    /// Loaded configuration.
    pub config: HikeSenseConfig,
    /// Sensor link, `None` when Bluetooth is unavailable.
    pub link: Option<Arc<Mutex<DeviceLink>>>,
    /// Link state, readable while discovery holds the link.
    pub link_state: Option<watch::Receiver<LinkState>>,
    /// Aborts a discovery without waiting for the link.
    pub scan: Option<ScanCanceller>,
    /// Alert detector and dispatcher.
    pub monitor: Arc<Mutex<AlertMonitor>>,
    /// Hike session.
    pub session: Arc<Mutex<SessionManager>>,
    /// Position reported by the UI.
    pub location: Arc<ReportedLocation>,
    /// Account service.
    pub backend: Arc<dyn Backend>,
    /// Most recent reading.
    pub latest: Arc<watch::Sender<Option<Reading>>>,
    /// Running telemetry pipeline, if connected.
    pub pipeline: Option<JoinHandle<PipelineSummary>>,
}

impl AppState {
    /// Wire up the state from configuration and services.
    #[must_use]
    pub fn new(config: HikeSenseConfig, services: Services) -> Self {
        let location = Arc::new(ReportedLocation::new());

        let link = services.transport.map(|transport| {
            DeviceLink::new(
                transport,
                services.permissions,
                Arc::clone(&services.clock),
                config.device.link_config(),
            )
        });
        if link.is_none() {
            warn!("Bluetooth unavailable; sensor endpoints will return 503");
        }
        let link_state = link.as_ref().map(DeviceLink::watch_state);
        let scan = link.as_ref().map(DeviceLink::canceller);

        let monitor = AlertMonitor::new(
            config.alerts,
            Arc::clone(&services.backend),
            Arc::clone(&location) as _,
            Arc::clone(&services.clock),
        );
        let session = SessionManager::new(
            services.directions,
            Arc::clone(&services.backend),
            Arc::clone(&location) as _,
            services.clock,
        );
        let (latest, _) = watch::channel(None);

        Self {
            config,
            link: link.map(|l| Arc::new(Mutex::new(l))),
            link_state,
            scan,
            monitor: Arc::new(Mutex::new(monitor)),
            session: Arc::new(Mutex::new(session)),
            location,
            backend: services.backend,
            latest: Arc::new(latest),
            pipeline: None,
        }
    }

    /// Wrap into the handle handlers receive.
    #[must_use]
    pub fn shared(self) -> SharedState {
        Arc::new(RwLock::new(self))
    }

    /// Whether the telemetry pipeline is still consuming readings.
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.pipeline.as_ref().is_some_and(|p| !p.is_finished())
    }

    /// Link status without waiting for an in-flight discovery.
    #[must_use]
    pub fn link_status(&self) -> Option<LinkStatus> {
        let link = self.link.as_ref()?;
        Some(link.try_lock().map_or_else(
            |_| LinkStatus {
                state: self
                    .link_state
                    .as_ref()
                    .map_or(LinkState::Idle, |rx| *rx.borrow()),
                peripheral: None,
            },
            |link| link.status(),
        ))
    }

    /// Release the sensor and wait for the pipeline to drain.
    pub async fn shutdown(&mut self) -> Option<PipelineSummary> {
        stop_telemetry(self.link.clone(), self.scan.as_ref(), self.pipeline.take()).await
    }
}

/// Tear the link down and collect the pipeline's counters.
///
/// A discovery in flight is cancelled first so the link lock frees up.
/// Tearing down ends the reading stream, so the pipeline finishes on its own.
pub async fn stop_telemetry(
    link: Option<Arc<Mutex<DeviceLink>>>,
    scan: Option<&ScanCanceller>,
    pipeline: Option<JoinHandle<PipelineSummary>>,
) -> Option<PipelineSummary> {
    if let Some(scan) = scan {
        scan.cancel();
    }
    if let Some(link) = link {
        link.lock().await.teardown().await;
    }
    match pipeline?.await {
        Ok(summary) => {
            info!(
                readings = summary.readings,
                alerts = summary.alerts_dispatched,
                "Telemetry stopped"
            );
            Some(summary)
        }
        Err(e) => {
            warn!(error = %e, "Telemetry pipeline ended abnormally");
            None
        }
    }
}
