//! Heart rate anomaly detection and alert throttling.
//!
//! [`AnomalyDetector`] keeps the last few readings and flags a run in which
//! every value is above the high threshold (tachycardia) or below the low
//! one (bradycardia). [`AlertThrottle`] enforces the minimum gap between
//! dispatch attempts, and [`AlertMonitor`] ties both to the backend.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use crate::backend::{AlertPayload, Backend};
use crate::clock::Clock;
use crate::config::AlertConfig;
use crate::location::LocationProvider;
use crate::types::Reading;

/// A sustained abnormal heart rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    /// Every reading in the window was above the high threshold.
    Tachycardia,
    /// Every reading in the window was below the low threshold.
    Bradycardia,
}

impl AnomalyKind {
    /// Alert text sent to the backend.
    #[must_use]
    pub fn message(&self, config: &AlertConfig) -> String {
        match self {
            Self::Tachycardia => format!("Heart rate above {} bpm", config.high_bpm),
            Self::Bradycardia => format!("Heart rate below {} bpm", config.low_bpm),
        }
    }
}

/// Trailing window over the most recent readings.
#[derive(Debug, Clone)]
pub struct AnomalyDetector {
    config: AlertConfig,
    window: VecDeque<u16>,
}

impl AnomalyDetector {
    /// Create an empty detector.
    #[must_use]
    pub fn new(config: AlertConfig) -> Self {
        let capacity = config.window.max(1);
        Self {
            config,
            window: VecDeque::with_capacity(capacity),
        }
    }

    /// Push a value and classify the window.
    ///
    /// Nothing is reported until the window is full.
    pub fn on_reading(&mut self, bpm: u16) -> Option<AnomalyKind> {
        let capacity = self.config.window.max(1);
        if self.window.len() == capacity {
            self.window.pop_front();
        }
        self.window.push_back(bpm);

        if self.window.len() < capacity {
            return None;
        }
        if self.window.iter().all(|&v| v > self.config.high_bpm) {
            Some(AnomalyKind::Tachycardia)
        } else if self.window.iter().all(|&v| v < self.config.low_bpm) {
            Some(AnomalyKind::Bradycardia)
        } else {
            None
        }
    }

    /// Values currently in the window, oldest first.
    #[must_use]
    pub fn window(&self) -> Vec<u16> {
        self.window.iter().copied().collect()
    }

    /// Forget all values.
    pub fn reset(&mut self) {
        self.window.clear();
    }
}

/// Minimum interval between alert dispatch attempts.
///
/// The last-alert timestamp only ever moves forward.
#[derive(Debug, Clone)]
pub struct AlertThrottle {
    interval_ms: i64,
    last_alert: Option<DateTime<Utc>>,
}

impl AlertThrottle {
    /// Create a throttle that has never fired.
    #[must_use]
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms: i64::try_from(interval_ms).unwrap_or(i64::MAX),
            last_alert: None,
        }
    }

    /// Claim the window at `now`.
    ///
    /// Returns `false` if less than the interval has passed since the last
    /// claim (or `now` is earlier than it); otherwise records `now` and
    /// returns `true`.
    pub fn try_acquire(&mut self, now: DateTime<Utc>) -> bool {
        if let Some(last) = self.last_alert {
            if (now - last).num_milliseconds() < self.interval_ms {
                return false;
            }
        }
        self.last_alert = Some(now);
        true
    }

    /// When the window was last claimed.
    #[must_use]
    pub const fn last_alert(&self) -> Option<DateTime<Utc>> {
        self.last_alert
    }
}

/// What the monitor did with one reading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AlertOutcome {
    /// No anomaly.
    Clear,
    /// Anomaly, but an alert went out too recently.
    Suppressed {
        /// Detected anomaly.
        kind: AnomalyKind,
    },
    /// Alert delivered.
    Dispatched {
        /// Detected anomaly.
        kind: AnomalyKind,
    },
    /// Alert attempted and failed; the throttle window is still consumed.
    DispatchFailed {
        /// Detected anomaly.
        kind: AnomalyKind,
        /// Backend error text.
        error: String,
    },
}

/// Verdict on one reading, taken while the monitor is locked.
pub enum Assessment {
    /// Nothing to send.
    Decided(AlertOutcome),
    /// The throttle window was claimed; the alert still has to go out.
    Dispatch(PendingAlert),
}

/// An alert that passed the throttle, ready to send without the monitor.
pub struct PendingAlert {
    kind: AnomalyKind,
    message: String,
    time: DateTime<Utc>,
    backend: Arc<dyn Backend>,
    location: Arc<dyn LocationProvider>,
}

impl PendingAlert {
    /// Detected anomaly.
    #[must_use]
    pub const fn kind(&self) -> AnomalyKind {
        self.kind
    }

    /// Deliver the alert with the best-known position.
    pub async fn send(self) -> AlertOutcome {
        let kind = self.kind;
        let alert = AlertPayload {
            message: self.message,
            location: self.location.current_position().await,
            time: self.time,
        };
        info!(
            ?kind,
            message = %alert.message,
            has_location = alert.location.is_some(),
            "Dispatching alert"
        );

        match self.backend.send_alert(&alert).await {
            Ok(()) => AlertOutcome::Dispatched { kind },
            Err(e) => {
                warn!(?kind, error = %e, "Failed to send alert");
                AlertOutcome::DispatchFailed {
                    kind,
                    error: e.to_string(),
                }
            }
        }
    }
}

/// Alert state for status reporting.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AlertSnapshot {
    /// Last dispatch attempt.
    pub last_alert: Option<DateTime<Utc>>,
    /// Values currently in the detector window.
    pub window: Vec<u16>,
    /// Outcome for the most recent reading.
    pub last_outcome: Option<AlertOutcome>,
    /// Alerts delivered since start.
    pub dispatched: u64,
    /// Alerts suppressed by the throttle since start.
    pub suppressed: u64,
    /// Alert deliveries that failed since start.
    pub failed: u64,
}

/// Detector, throttle and dispatch for one monitoring session.
pub struct AlertMonitor {
    config: AlertConfig,
    detector: AnomalyDetector,
    throttle: AlertThrottle,
    backend: Arc<dyn Backend>,
    location: Arc<dyn LocationProvider>,
    clock: Arc<dyn Clock>,
    last_outcome: Option<AlertOutcome>,
    dispatched: u64,
    suppressed: u64,
    failed: u64,
}

impl AlertMonitor {
    /// Create a monitor that has never alerted.
    pub fn new(
        config: AlertConfig,
        backend: Arc<dyn Backend>,
        location: Arc<dyn LocationProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            detector: AnomalyDetector::new(config),
            throttle: AlertThrottle::new(config.throttle_ms),
            backend,
            location,
            clock,
            last_outcome: None,
            dispatched: 0,
            suppressed: 0,
            failed: 0,
        }
    }

    /// Feed one reading and dispatch an alert if warranted.
    ///
    /// Holds `self` across the backend call; shared monitors should use
    /// [`assess`](Self::assess) and [`record_dispatch`](Self::record_dispatch)
    /// around [`PendingAlert::send`] instead.
    pub async fn on_reading(&mut self, reading: &Reading) -> AlertOutcome {
        match self.assess(reading) {
            Assessment::Decided(outcome) => outcome,
            Assessment::Dispatch(alert) => {
                let outcome = alert.send().await;
                self.record_dispatch(&outcome);
                outcome
            }
        }
    }

    /// Run the detector and the throttle for one reading.
    ///
    /// A claimed throttle window stays claimed even if the alert is never
    /// sent.
    pub fn assess(&mut self, reading: &Reading) -> Assessment {
        let Some(kind) = self.detector.on_reading(reading.bpm) else {
            self.last_outcome = Some(AlertOutcome::Clear);
            return Assessment::Decided(AlertOutcome::Clear);
        };

        let now = self.clock.now();
        if !self.throttle.try_acquire(now) {
            debug!(?kind, "Alert suppressed by throttle");
            self.suppressed += 1;
            let outcome = AlertOutcome::Suppressed { kind };
            self.last_outcome = Some(outcome.clone());
            return Assessment::Decided(outcome);
        }

        Assessment::Dispatch(PendingAlert {
            kind,
            message: kind.message(&self.config),
            time: now,
            backend: Arc::clone(&self.backend),
            location: Arc::clone(&self.location),
        })
    }

    /// Count the result of a [`PendingAlert::send`].
    pub fn record_dispatch(&mut self, outcome: &AlertOutcome) {
        match outcome {
            AlertOutcome::Dispatched { .. } => self.dispatched += 1,
            AlertOutcome::DispatchFailed { .. } => self.failed += 1,
            AlertOutcome::Clear | AlertOutcome::Suppressed { .. } => {}
        }
        self.last_outcome = Some(outcome.clone());
    }

    /// Drop buffered readings, e.g. after the sensor reconnects.
    ///
    /// The throttle keeps its last alert time.
    pub fn reset_window(&mut self) {
        self.detector.reset();
    }

    /// Current alert state.
    #[must_use]
    pub fn snapshot(&self) -> AlertSnapshot {
        AlertSnapshot {
            last_alert: self.throttle.last_alert(),
            window: self.detector.window(),
            last_outcome: self.last_outcome.clone(),
            dispatched: self.dispatched,
            suppressed: self.suppressed,
            failed: self.failed,
        }
    }
}
