//! # hikesense-core
//!
//! Core telemetry and session logic for the HikeSense hiking companion.
//!
//! This crate provides:
//! - A Bluetooth Low Energy link to the HikeSense heart rate wearable
//! - Windowed anomaly detection with a throttled alert dispatcher
//! - The hike session state machine and end-of-hike summary
//! - Clients for the account backend and the directions service
//!
//! ## Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`bluetooth`] - Sensor discovery, connection and notification decoding
//! - [`anomaly`] - Tachycardia/bradycardia detection and alert throttling
//! - [`session`] - Hike lifecycle from selection to backend submission
//! - [`telemetry`] - Fans sensor readings out to alerts and the session
//! - [`backend`] - HTTP clients for alerts, SOS, sessions and routes
//! - [`polyline`] - Encoded polyline codec for route geometry
//! - [`location`] - Source of the user's current position
//! - [`clock`] - Injectable wall clock
//! - [`config`] - Application configuration loading, saving, and validation
//! - [`error`] - Unified error types for the crate
//! - [`types`] - Shared types and OpenAPI schemas

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod anomaly;
pub mod backend;
pub mod bluetooth;
pub mod clock;
pub mod config;
pub mod error;
pub mod location;
pub mod polyline;
pub mod session;
pub mod telemetry;
pub mod types;

// Re-export primary types for convenience
pub use anomaly::{
    AlertMonitor, AlertOutcome, AlertSnapshot, AnomalyDetector, AnomalyKind, Assessment, PendingAlert,
};
pub use backend::{
    Backend, BackendError, BackendResult, DirectionsProvider, GoogleDirections, HttpBackend,
};
#[cfg(feature = "bluetooth")]
pub use bluetooth::bluez::BluezTransport;
pub use bluetooth::mock::{MockPermissions, MockTransport};
pub use bluetooth::{
    BleTransport, DeviceLink, LinkError, LinkResult, LinkState, LinkStatus, PermissionGate,
    ReadingSubscription,
};
pub use clock::{Clock, SystemClock};
pub use config::{
    AlertConfig, BackendConfig, ConfigError, ConfigResult, DeviceConfig, DirectionsConfig,
    HikeSenseConfig, ServerConfig,
};
pub use error::{Error, HikeSenseError, Result};
pub use location::{LocationProvider, ReportedLocation};
pub use session::{
    PendingSos, PendingSubmission, RouteLookup, SessionError, SessionManager, SessionRecord,
    SessionState, SubmissionReport,
};
pub use telemetry::{run_pipeline, PipelineSummary};
pub use types::{GeoPoint, HealthResponse, Hike, HikeAlert, Reading};
