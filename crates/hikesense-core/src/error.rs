//! Unified error types for the HikeSense core library.
//!
//! This module provides a unified error type [`HikeSenseError`] that covers all
//! failure modes across the telemetry and session subsystem. Each module also
//! has its own specific error type ([`LinkError`], [`FrameError`],
//! [`PolylineError`], [`SessionError`], [`BackendError`], [`ConfigError`]) for
//! internal use.
//!
//! # Design Principles
//!
//! - **Specific variants**: Each error variant captures exactly one failure mode
//! - **Actionable messages**: Error messages guide users toward resolution
//! - **HTTP-ready**: Error types include HTTP status codes and error codes
//!
//! # Example
//!
//! ```rust
//! use hikesense_core::error::{HikeSenseError, Result};
//!
//! fn require_sensor(connected: bool) -> Result<()> {
//!     if !connected {
//!         return Err(HikeSenseError::NotConnected);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! [`LinkError`]: crate::bluetooth::LinkError
//! [`FrameError`]: crate::bluetooth::FrameError
//! [`PolylineError`]: crate::polyline::PolylineError
//! [`SessionError`]: crate::session::SessionError
//! [`BackendError`]: crate::backend::BackendError
//! [`ConfigError`]: crate::config::ConfigError

use thiserror::Error;

use crate::session::{SessionAction, SessionState};

/// The unified error type for all HikeSense operations.
#[derive(Debug, Error)]
pub enum HikeSenseError {
    // =========================================================================
    // BLUETOOTH ERRORS
    // =========================================================================
    /// No Bluetooth adapter was found on this system.
    #[error(
        "No Bluetooth adapter found. Ensure Bluetooth hardware is present and drivers are loaded."
    )]
    BluetoothAdapterNotFound,

    /// The Bluetooth adapter exists but is powered off.
    #[error("Bluetooth adapter is powered off. Run 'bluetoothctl power on' to enable.")]
    BluetoothAdapterPoweredOff,

    /// The Bluetooth stack could not be used at all.
    #[error("Bluetooth unavailable: {0}")]
    AdapterUnavailable(String),

    /// Bluetooth permissions were not granted.
    #[error("Bluetooth permissions not granted. Grant access and try again.")]
    PermissionDenied,

    /// The link is already scanning, connecting or streaming.
    #[error("Sensor link is busy ({0}). Disconnect first.")]
    LinkBusy(String),

    /// Discovery ran out of time.
    #[error("No sensor found within {duration_secs} seconds. Ensure it is powered on and nearby.")]
    DiscoveryTimeout {
        /// Configured bound.
        duration_secs: u64,
    },

    /// Discovery was stopped by a disconnect request.
    #[error("Sensor discovery was cancelled")]
    DiscoveryCancelled,

    /// The scan ended without seeing the sensor.
    #[error("Sensor not found: '{0}'. Ensure the device is powered on and within range.")]
    NoMatchingDevice(String),

    /// The scan itself failed.
    #[error("Bluetooth scan failed: {0}")]
    DiscoveryFailed(String),

    /// The connection could not be established.
    #[error("Connection to sensor failed: {0}")]
    ConnectionFailed(String),

    /// The sensor does not expose the heart rate characteristic.
    #[error("Sensor does not expose the heart rate characteristic: {0}")]
    CharacteristicNotFound(String),

    /// An operation needed a connected sensor.
    #[error("No sensor connected")]
    NotConnected,

    /// Notifications could not be enabled.
    #[error("Failed to subscribe to heart rate notifications: {0}")]
    SubscriptionFailed(String),

    /// A notification could not be decoded.
    #[error("Invalid heart rate frame: {0}")]
    FrameDecode(String),

    // =========================================================================
    // ROUTE & SESSION ERRORS
    // =========================================================================
    /// An encoded route was malformed.
    #[error("Invalid route polyline: {0}")]
    Polyline(String),

    /// The session cannot perform the action in its current state.
    #[error("Cannot {action} while session is {from}")]
    InvalidTransition {
        /// Current state.
        from: SessionState,
        /// Rejected action.
        action: SessionAction,
    },

    // =========================================================================
    // BACKEND ERRORS
    // =========================================================================
    /// A required backend setting (token, API key, URL) is missing or invalid.
    #[error("Backend not configured: {0}")]
    BackendNotConfigured(String),

    /// The backend could not be reached.
    #[error("Backend request failed: {0}")]
    BackendUnreachable(String),

    /// The backend answered with an error status.
    #[error("Backend rejected request with HTTP {status}: {message}")]
    BackendRejected {
        /// HTTP status returned.
        status: u16,
        /// Details.
        message: String,
    },

    // =========================================================================
    // CONFIGURATION ERRORS
    // =========================================================================
    /// The configuration could not be loaded or parsed.
    #[error("Failed to parse configuration: {0}")]
    ConfigParseError(String),

    /// The configuration was parsed but contains invalid values.
    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),

    // =========================================================================
    // PERSISTENCE & I/O ERRORS
    // =========================================================================
    /// An error occurred while writing data.
    #[error("Persistence error: {0}")]
    PersistenceError(String),

    /// A low-level I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// A specialized [`Result`] type for HikeSense operations.
pub type Result<T> = std::result::Result<T, HikeSenseError>;

/// Alias for [`HikeSenseError`].
pub type Error = HikeSenseError;

impl HikeSenseError {
    /// Returns `true` if this error is related to the sensor link.
    #[inline]
    #[must_use]
    pub const fn is_bluetooth_error(&self) -> bool {
        matches!(
            self,
            Self::BluetoothAdapterNotFound
                | Self::BluetoothAdapterPoweredOff
                | Self::AdapterUnavailable(_)
                | Self::PermissionDenied
                | Self::LinkBusy(_)
                | Self::DiscoveryTimeout { .. }
                | Self::DiscoveryCancelled
                | Self::NoMatchingDevice(_)
                | Self::DiscoveryFailed(_)
                | Self::ConnectionFailed(_)
                | Self::CharacteristicNotFound(_)
                | Self::NotConnected
                | Self::SubscriptionFailed(_)
                | Self::FrameDecode(_)
        )
    }

    /// Returns `true` if this error is related to the hike session or route.
    #[inline]
    #[must_use]
    pub const fn is_session_error(&self) -> bool {
        matches!(self, Self::InvalidTransition { .. } | Self::Polyline(_))
    }

    /// Returns `true` if this error came from the account or directions service.
    #[inline]
    #[must_use]
    pub const fn is_backend_error(&self) -> bool {
        matches!(
            self,
            Self::BackendNotConfigured(_)
                | Self::BackendUnreachable(_)
                | Self::BackendRejected { .. }
        )
    }

    /// Returns `true` if this error is related to configuration.
    #[inline]
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigParseError(_) | Self::ConfigValidationError(_)
        )
    }

    /// Returns `true` if this error is related to I/O or persistence.
    #[inline]
    #[must_use]
    pub const fn is_io_error(&self) -> bool {
        matches!(self, Self::PersistenceError(_) | Self::IoError(_))
    }

    /// Returns `true` if retrying the same operation may succeed.
    #[inline]
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::PermissionDenied
                | Self::DiscoveryTimeout { .. }
                | Self::DiscoveryCancelled
                | Self::NoMatchingDevice(_)
                | Self::DiscoveryFailed(_)
                | Self::ConnectionFailed(_)
                | Self::CharacteristicNotFound(_)
                | Self::FrameDecode(_)
                | Self::BackendUnreachable(_)
        )
    }

    /// Returns an HTTP-appropriate status code for this error.
    #[inline]
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            // 403 Forbidden - platform refused access
            Self::PermissionDenied => 403,

            // 404 Not Found
            Self::NoMatchingDevice(_) => 404,

            // 409 Conflict - wrong state for the request
            Self::LinkBusy(_)
            | Self::DiscoveryCancelled
            | Self::NotConnected
            | Self::InvalidTransition { .. } => 409,

            // 422 Unprocessable Entity - semantic errors
            Self::FrameDecode(_)
            | Self::Polyline(_)
            | Self::ConfigParseError(_)
            | Self::ConfigValidationError(_) => 422,

            // 424 Failed Dependency - missing setup
            Self::BackendNotConfigured(_) => 424,

            // 500 Internal Server Error - server-side issues
            Self::PersistenceError(_) | Self::IoError(_) => 500,

            // 502 Bad Gateway - sensor or backend misbehaved
            Self::ConnectionFailed(_)
            | Self::CharacteristicNotFound(_)
            | Self::SubscriptionFailed(_)
            | Self::BackendUnreachable(_)
            | Self::BackendRejected { .. } => 502,

            // 503 Service Unavailable - Bluetooth hardware issues
            Self::BluetoothAdapterNotFound
            | Self::BluetoothAdapterPoweredOff
            | Self::AdapterUnavailable(_)
            | Self::DiscoveryFailed(_) => 503,

            // 504 Gateway Timeout
            Self::DiscoveryTimeout { .. } => 504,
        }
    }

    /// Returns a machine-readable error code for API responses.
    #[inline]
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::BluetoothAdapterNotFound => "BLUETOOTH_ADAPTER_NOT_FOUND",
            Self::BluetoothAdapterPoweredOff => "BLUETOOTH_ADAPTER_POWERED_OFF",
            Self::AdapterUnavailable(_) => "ADAPTER_UNAVAILABLE",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::LinkBusy(_) => "LINK_BUSY",
            Self::DiscoveryTimeout { .. } => "DISCOVERY_TIMEOUT",
            Self::DiscoveryCancelled => "DISCOVERY_CANCELLED",
            Self::NoMatchingDevice(_) => "NO_MATCHING_DEVICE",
            Self::DiscoveryFailed(_) => "DISCOVERY_FAILED",
            Self::ConnectionFailed(_) => "CONNECTION_FAILED",
            Self::CharacteristicNotFound(_) => "CHARACTERISTIC_NOT_FOUND",
            Self::NotConnected => "NOT_CONNECTED",
            Self::SubscriptionFailed(_) => "SUBSCRIPTION_FAILED",
            Self::FrameDecode(_) => "FRAME_DECODE_ERROR",
            Self::Polyline(_) => "INVALID_POLYLINE",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::BackendNotConfigured(_) => "BACKEND_NOT_CONFIGURED",
            Self::BackendUnreachable(_) => "BACKEND_UNREACHABLE",
            Self::BackendRejected { .. } => "BACKEND_REJECTED",
            Self::ConfigParseError(_) => "CONFIG_PARSE_ERROR",
            Self::ConfigValidationError(_) => "CONFIG_VALIDATION_ERROR",
            Self::PersistenceError(_) => "PERSISTENCE_ERROR",
            Self::IoError(_) => "IO_ERROR",
        }
    }
}

// =============================================================================
// CONVERSIONS FROM MODULE-SPECIFIC ERRORS
// =============================================================================

impl From<crate::bluetooth::LinkError> for HikeSenseError {
    fn from(err: crate::bluetooth::LinkError) -> Self {
        use crate::bluetooth::LinkError;
        match err {
            LinkError::AdapterNotFound => Self::BluetoothAdapterNotFound,
            LinkError::AdapterPoweredOff => Self::BluetoothAdapterPoweredOff,
            LinkError::SessionInitFailed { message } | LinkError::Internal { message } => {
                Self::AdapterUnavailable(message)
            }
            LinkError::PermissionDenied => Self::PermissionDenied,
            LinkError::Busy { state } => Self::LinkBusy(state.to_string()),
            LinkError::DiscoveryTimeout { duration_secs } => {
                Self::DiscoveryTimeout { duration_secs }
            }
            LinkError::DiscoveryCancelled => Self::DiscoveryCancelled,
            LinkError::NoMatchingDevice { name } => Self::NoMatchingDevice(name),
            LinkError::DiscoveryFailed { message } => Self::DiscoveryFailed(message),
            LinkError::InvalidAddress { address } => {
                Self::ConnectionFailed(format!("Invalid Bluetooth address: {address}"))
            }
            LinkError::ConnectionFailed { id, message } => {
                Self::ConnectionFailed(format!("{id}: {message}"))
            }
            err @ LinkError::CharacteristicNotFound { .. } => {
                Self::CharacteristicNotFound(err.to_string())
            }
            LinkError::NotConnected => Self::NotConnected,
            LinkError::SubscriptionFailed { message } => Self::SubscriptionFailed(message),
        }
    }
}

impl From<crate::bluetooth::FrameError> for HikeSenseError {
    fn from(err: crate::bluetooth::FrameError) -> Self {
        Self::FrameDecode(err.to_string())
    }
}

impl From<crate::polyline::PolylineError> for HikeSenseError {
    fn from(err: crate::polyline::PolylineError) -> Self {
        Self::Polyline(err.to_string())
    }
}

impl From<crate::session::SessionError> for HikeSenseError {
    fn from(err: crate::session::SessionError) -> Self {
        use crate::session::SessionError;
        match err {
            SessionError::InvalidTransition { from, action } => {
                Self::InvalidTransition { from, action }
            }
            SessionError::Sos(e) => e.into(),
        }
    }
}

impl From<crate::backend::BackendError> for HikeSenseError {
    fn from(err: crate::backend::BackendError) -> Self {
        use crate::backend::BackendError;
        match err {
            BackendError::InvalidUrl(_) | BackendError::MissingToken | BackendError::MissingApiKey => {
                Self::BackendNotConfigured(err.to_string())
            }
            BackendError::Transport { .. } | BackendError::Decode { .. } => {
                Self::BackendUnreachable(err.to_string())
            }
            BackendError::Status {
                endpoint,
                status,
                body,
            } => Self::BackendRejected {
                status,
                message: if body.is_empty() {
                    endpoint
                } else {
                    format!("{endpoint}: {body}")
                },
            },
        }
    }
}

impl From<crate::config::ConfigError> for HikeSenseError {
    fn from(err: crate::config::ConfigError) -> Self {
        use crate::config::ConfigError;
        match err {
            ConfigError::NoConfigDir => Self::PersistenceError(err.to_string()),
            ConfigError::Load(message) => Self::ConfigParseError(message),
            ConfigError::WriteError { path, source } => {
                Self::PersistenceError(format!("Failed to write {path}: {source}"))
            }
            ConfigError::SerializeError(e) => Self::ConfigParseError(e.to_string()),
            err @ (ConfigError::ValidationError { .. }
            | ConfigError::MultipleValidationErrors(_)) => {
                Self::ConfigValidationError(err.to_string())
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendError;
    use crate::bluetooth::{FrameError, LinkError, LinkState};
    use crate::config::ConfigError;
    use crate::polyline::PolylineError;
    use crate::session::SessionError;
    use std::io::{Error as IoErr, ErrorKind};

    #[test]
    fn test_bluetooth_error_classification() {
        assert!(HikeSenseError::BluetoothAdapterNotFound.is_bluetooth_error());
        assert!(HikeSenseError::PermissionDenied.is_bluetooth_error());
        assert!(HikeSenseError::DiscoveryTimeout { duration_secs: 30 }.is_bluetooth_error());
        assert!(HikeSenseError::FrameDecode("short".into()).is_bluetooth_error());

        assert!(!HikeSenseError::Polyline("bad".into()).is_bluetooth_error());
    }

    #[test]
    fn test_session_and_backend_classification() {
        let transition = HikeSenseError::InvalidTransition {
            from: SessionState::NoSelection,
            action: SessionAction::Start,
        };
        assert!(transition.is_session_error());
        assert!(!transition.is_backend_error());

        assert!(HikeSenseError::BackendUnreachable("timeout".into()).is_backend_error());
        assert!(HikeSenseError::ConfigValidationError("x".into()).is_config_error());
        assert!(HikeSenseError::IoError(IoErr::new(ErrorKind::NotFound, "x")).is_io_error());
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(HikeSenseError::DiscoveryTimeout { duration_secs: 30 }.is_recoverable());
        assert!(HikeSenseError::NoMatchingDevice("HikeSenseBLE".into()).is_recoverable());
        assert!(HikeSenseError::ConnectionFailed("x".into()).is_recoverable());
        assert!(!HikeSenseError::BluetoothAdapterNotFound.is_recoverable());
        assert!(!HikeSenseError::ConfigValidationError("x".into()).is_recoverable());
    }

    #[test]
    fn test_http_status_codes() {
        assert_eq!(HikeSenseError::PermissionDenied.http_status_code(), 403);
        assert_eq!(
            HikeSenseError::NoMatchingDevice("x".into()).http_status_code(),
            404
        );
        assert_eq!(HikeSenseError::NotConnected.http_status_code(), 409);
        assert_eq!(
            HikeSenseError::Polyline("x".into()).http_status_code(),
            422
        );
        assert_eq!(
            HikeSenseError::BackendNotConfigured("x".into()).http_status_code(),
            424
        );
        assert_eq!(
            HikeSenseError::BackendRejected {
                status: 500,
                message: String::new()
            }
            .http_status_code(),
            502
        );
        assert_eq!(
            HikeSenseError::BluetoothAdapterNotFound.http_status_code(),
            503
        );
        assert_eq!(
            HikeSenseError::DiscoveryTimeout { duration_secs: 1 }.http_status_code(),
            504
        );
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            HikeSenseError::PermissionDenied.error_code(),
            "PERMISSION_DENIED"
        );
        assert_eq!(
            HikeSenseError::InvalidTransition {
                from: SessionState::Completed,
                action: SessionAction::Start
            }
            .error_code(),
            "INVALID_TRANSITION"
        );
    }

    #[test]
    fn test_from_link_error() {
        let err: HikeSenseError = LinkError::DiscoveryTimeout { duration_secs: 30 }.into();
        assert!(matches!(
            err,
            HikeSenseError::DiscoveryTimeout { duration_secs: 30 }
        ));

        let err: HikeSenseError = LinkError::Busy {
            state: LinkState::Streaming,
        }
        .into();
        assert!(err.to_string().contains("streaming"));
    }

    #[test]
    fn test_cancelled_discovery_is_a_conflict() {
        let err: HikeSenseError = LinkError::DiscoveryCancelled.into();
        assert_eq!(err.http_status_code(), 409);
        assert_eq!(err.error_code(), "DISCOVERY_CANCELLED");
        assert!(err.is_bluetooth_error());
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_from_module_errors() {
        let err: HikeSenseError = FrameError::TooShort(1).into();
        assert_eq!(err.error_code(), "FRAME_DECODE_ERROR");

        let err: HikeSenseError = PolylineError::Truncated { offset: 3 }.into();
        assert!(err.to_string().contains("offset 3"));

        let err: HikeSenseError = SessionError::Sos(BackendError::MissingToken).into();
        assert!(matches!(err, HikeSenseError::BackendNotConfigured(_)));

        let err: HikeSenseError = BackendError::Status {
            endpoint: "sos/send-sos".into(),
            status: 401,
            body: "expired".into(),
        }
        .into();
        assert!(matches!(
            err,
            HikeSenseError::BackendRejected { status: 401, .. }
        ));

        let err: HikeSenseError = ConfigError::ValidationError {
            field: "alerts.window".into(),
            message: "must be at least 1".into(),
        }
        .into();
        assert!(err.is_config_error());
        assert!(err.to_string().contains("alerts.window"));
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<HikeSenseError>();
        assert_sync::<HikeSenseError>();
    }
}
