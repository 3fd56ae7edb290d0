//! Reading fan-out.
//!
//! One task drains a [`ReadingSubscription`] and hands every reading, in
//! arrival order, to the latest-value channel, the alert monitor and the
//! session. Alert delivery happens outside both locks.

use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tracing::{debug, info};

use crate::anomaly::{AlertMonitor, AlertOutcome, Assessment};
use crate::bluetooth::ReadingSubscription;
use crate::session::SessionManager;
use crate::types::Reading;

/// Counters for one pipeline run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineSummary {
    /// Readings consumed.
    pub readings: u64,
    /// Alerts that reached the backend.
    pub alerts_dispatched: u64,
}

/// Consume `subscription` to completion.
///
/// Returns when the sensor stream ends or the subscription is cancelled.
pub async fn run_pipeline(
    mut subscription: ReadingSubscription,
    monitor: Arc<Mutex<AlertMonitor>>,
    session: Arc<Mutex<SessionManager>>,
    latest: Arc<watch::Sender<Option<Reading>>>,
) -> PipelineSummary {
    let mut summary = PipelineSummary::default();
    info!("Telemetry pipeline started");

    while let Some(reading) = subscription.next_reading().await {
        summary.readings += 1;
        latest.send_replace(Some(reading));

        let assessment = monitor.lock().await.assess(&reading);
        session.lock().await.record(reading);

        let outcome = match assessment {
            Assessment::Decided(outcome) => outcome,
            Assessment::Dispatch(alert) => {
                // No lock is held while the alert is in flight.
                let outcome = alert.send().await;
                monitor.lock().await.record_dispatch(&outcome);
                outcome
            }
        };
        if matches!(outcome, AlertOutcome::Dispatched { .. }) {
            summary.alerts_dispatched += 1;
        }
        debug!(bpm = reading.bpm, ?outcome, "Reading processed");
    }

    info!(
        readings = summary.readings,
        alerts = summary.alerts_dispatched,
        "Telemetry pipeline stopped"
    );
    summary
}
