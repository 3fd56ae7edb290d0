//! Bluetooth Low Energy link to the heart rate sensor.
//!
//! This module provides functionality to:
//! - Negotiate Bluetooth permissions before touching the radio
//! - Scan for the sensor by advertised name, with a bounded scan time
//! - Connect and verify the heart rate service/characteristic exists
//! - Subscribe to notifications and decode them into [`Reading`]s
//! - Release the scan, the subscription and the connection on teardown
//!
//! The radio itself sits behind [`BleTransport`]. [`bluez::BluezTransport`]
//! talks to BlueZ on Linux (feature `bluetooth`); [`mock::MockTransport`] is
//! an in-memory peripheral used by tests and by the daemon's
//! `mock-bluetooth` build.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::clock::Clock;
use crate::types::Reading;

#[cfg(feature = "bluetooth")]
pub mod bluez;
pub mod frame;
pub mod mock;

pub use frame::{decode_frame, Frame, FrameError};

/// Advertised name of the HikeSense wearable.
pub const SENSOR_NAME: &str = "HikeSenseBLE";

/// GATT service exposing the heart rate stream.
pub const HEART_RATE_SERVICE_UUID: Uuid = Uuid::from_u128(0xabcd_efab_1234_5678_1234_5678_9abc_def0);

/// Notifying characteristic carrying one reading per frame.
pub const HEART_RATE_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0xabcd_efab_4321_5678_1234_5678_9abc_def0);

/// Default upper bound on a discovery pass.
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of decoded readings buffered between the radio and consumers.
pub const DEFAULT_READING_BUFFER: usize = 64;

// =============================================================================
// ERRORS
// =============================================================================

/// Errors raised by the device link.
#[derive(Debug, Clone, Error)]
pub enum LinkError {
    /// No Bluetooth adapter was found.
    #[error("No Bluetooth adapter found")]
    AdapterNotFound,

    /// The adapter exists but could not be powered on.
    #[error("Bluetooth adapter is powered off")]
    AdapterPoweredOff,

    /// The connection to the Bluetooth daemon could not be opened.
    #[error("Failed to open Bluetooth session: {message}")]
    SessionInitFailed {
        /// Underlying error text.
        message: String,
    },

    /// Bluetooth permissions were not granted.
    #[error("Bluetooth permissions not granted")]
    PermissionDenied,

    /// An operation was requested while the link was in an incompatible state.
    #[error("Device link is busy ({state})")]
    Busy {
        /// State the link was in.
        state: LinkState,
    },

    /// Discovery ran for the whole allowed time without a match.
    #[error("No sensor found within {duration_secs} seconds")]
    DiscoveryTimeout {
        /// Configured bound.
        duration_secs: u64,
    },

    /// Discovery was stopped through a [`ScanCanceller`].
    #[error("Discovery cancelled")]
    DiscoveryCancelled,

    /// The scan finished without seeing the requested device.
    #[error("Device not found: '{name}'")]
    NoMatchingDevice {
        /// Advertised name that was searched for.
        name: String,
    },

    /// The transport reported a scan failure.
    #[error("Bluetooth scan failed: {message}")]
    DiscoveryFailed {
        /// Underlying error text.
        message: String,
    },

    /// A peripheral identifier could not be parsed by the backend.
    #[error("Invalid Bluetooth address: {address}")]
    InvalidAddress {
        /// The rejected identifier.
        address: String,
    },

    /// Connecting to the peripheral failed.
    #[error("Failed to connect to {id}: {message}")]
    ConnectionFailed {
        /// Peripheral identifier.
        id: String,
        /// Underlying error text.
        message: String,
    },

    /// The connected peripheral does not expose the heart rate characteristic.
    #[error("Characteristic {characteristic} not found in service {service}")]
    CharacteristicNotFound {
        /// Expected service.
        service: Uuid,
        /// Expected characteristic.
        characteristic: Uuid,
    },

    /// A subscription was requested without an active connection.
    #[error("No sensor connected")]
    NotConnected,

    /// Registering for notifications failed.
    #[error("Failed to subscribe to notifications: {message}")]
    SubscriptionFailed {
        /// Underlying error text.
        message: String,
    },

    /// Any other backend failure.
    #[error("Bluetooth error: {message}")]
    Internal {
        /// Underlying error text.
        message: String,
    },
}

impl LinkError {
    /// Whether re-running discovery can fix this.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::DiscoveryTimeout { .. }
                | Self::DiscoveryCancelled
                | Self::NoMatchingDevice { .. }
                | Self::DiscoveryFailed { .. }
                | Self::ConnectionFailed { .. }
                | Self::CharacteristicNotFound { .. }
                | Self::NotConnected
        )
    }
}

/// Result alias for link operations.
pub type LinkResult<T> = std::result::Result<T, LinkError>;

// =============================================================================
// TYPES
// =============================================================================

/// Opaque peripheral identifier (a MAC address on BlueZ).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
#[schema(value_type = String, example = "C8:2E:18:4A:90:11")]
pub struct PeripheralId(String);

impl PeripheralId {
    /// Wrap an identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Connection state of the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PeripheralState {
    /// Seen in a scan.
    Discovered,
    /// Connection in progress.
    Connecting,
    /// Connected and verified.
    Connected,
    /// Connection closed or lost.
    Disconnected,
}

/// The sensor the link is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Peripheral {
    /// Backend identifier.
    pub id: PeripheralId,
    /// Advertised name.
    #[schema(example = "HikeSenseBLE")]
    pub name: String,
    /// Current connection state.
    pub state: PeripheralState,
}

/// One scan result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Backend identifier.
    pub id: PeripheralId,
    /// Advertised local name, if any.
    pub name: Option<String>,
}

/// A GATT service and the characteristics it exposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    /// Service UUID.
    pub uuid: Uuid,
    /// Characteristic UUIDs.
    pub characteristics: Vec<Uuid>,
}

impl ServiceDescriptor {
    /// Whether this service exposes `characteristic`.
    #[must_use]
    pub fn has_characteristic(&self, characteristic: Uuid) -> bool {
        self.characteristics.contains(&characteristic)
    }
}

/// State of the device link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    /// Nothing running.
    Idle,
    /// Discovery in progress.
    Scanning,
    /// Sensor found, not yet connected.
    Found,
    /// Connection in progress.
    Connecting,
    /// Connected, no subscription yet.
    Connected,
    /// Connected and delivering readings.
    Streaming,
    /// Connection closed.
    Disconnected,
    /// The last operation failed.
    Failed,
}

impl LinkState {
    /// Lowercase name used in logs and errors.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Scanning => "scanning",
            Self::Found => "found",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Streaming => "streaming",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
        }
    }

    /// Whether the radio is in use.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Scanning | Self::Connecting | Self::Connected | Self::Streaming
        )
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of the link for status reporting.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LinkStatus {
    /// Link state.
    pub state: LinkState,
    /// Attached sensor, if any.
    pub peripheral: Option<Peripheral>,
}

/// Outcome of a permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PermissionStatus {
    /// Scanning and connecting are allowed.
    Granted,
    /// The platform refused.
    Denied,
}

/// Link settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    /// Advertised name to connect to.
    pub device_name: String,
    /// Heart rate service.
    pub service_uuid: Uuid,
    /// Heart rate characteristic.
    pub characteristic_uuid: Uuid,
    /// Upper bound on one discovery pass.
    pub discovery_timeout: Duration,
    /// Readings buffered between the radio and consumers.
    pub reading_buffer: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            device_name: SENSOR_NAME.to_string(),
            service_uuid: HEART_RATE_SERVICE_UUID,
            characteristic_uuid: HEART_RATE_CHARACTERISTIC_UUID,
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            reading_buffer: DEFAULT_READING_BUFFER,
        }
    }
}

// =============================================================================
// COLLABORATORS
// =============================================================================

/// Stream of scan results.
pub type AdvertisementStream = BoxStream<'static, LinkResult<Advertisement>>;

/// Stream of raw notifications from one characteristic.
pub type FrameStream = BoxStream<'static, LinkResult<Frame>>;

/// The radio.
#[async_trait]
pub trait BleTransport: Send + Sync {
    /// Start scanning. Results arrive until the stream is dropped.
    async fn start_scan(&self) -> LinkResult<AdvertisementStream>;

    /// Stop any scan in progress.
    async fn stop_scan(&self) -> LinkResult<()>;

    /// Open a connection.
    async fn connect(&self, id: &PeripheralId) -> LinkResult<()>;

    /// Enumerate services and characteristics of a connected peripheral.
    async fn discover_services(&self, id: &PeripheralId) -> LinkResult<Vec<ServiceDescriptor>>;

    /// Enable notifications on a characteristic.
    async fn monitor(
        &self,
        id: &PeripheralId,
        service: Uuid,
        characteristic: Uuid,
    ) -> LinkResult<FrameStream>;

    /// Close a connection.
    async fn disconnect(&self, id: &PeripheralId) -> LinkResult<()>;
}

/// Platform permission negotiation.
#[async_trait]
pub trait PermissionGate: Send + Sync {
    /// Ask for scan/connect access.
    async fn request_capability_access(&self) -> PermissionStatus;
}

/// Permission gate for platforms without a runtime prompt (BlueZ).
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysGranted;

#[async_trait]
impl PermissionGate for AlwaysGranted {
    async fn request_capability_access(&self) -> PermissionStatus {
        PermissionStatus::Granted
    }
}

// =============================================================================
// SUBSCRIPTION
// =============================================================================

/// Decoded readings from one characteristic, in arrival order.
///
/// Dropping the subscription (or calling [`cancel`](Self::cancel)) stops the
/// notification pump.
#[derive(Debug)]
pub struct ReadingSubscription {
    readings: mpsc::Receiver<Reading>,
    pump: JoinHandle<()>,
}

impl ReadingSubscription {
    /// Next reading, or `None` once the stream ended or was cancelled.
    pub async fn next_reading(&mut self) -> Option<Reading> {
        self.readings.recv().await
    }

    /// Whether the pump is still running.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.pump.is_finished()
    }

    /// Stop receiving readings.
    pub fn cancel(self) {
        drop(self);
    }
}

impl futures::Stream for ReadingSubscription {
    type Item = Reading;

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.get_mut().readings.poll_recv(cx)
    }
}

impl Drop for ReadingSubscription {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// Decode frames in arrival order and forward them as readings.
///
/// When the sensor ends the stream the connection is closed here, so a link
/// that is not torn down explicitly does not keep it open.
async fn pump_frames(
    mut frames: FrameStream,
    readings: mpsc::Sender<Reading>,
    clock: Arc<dyn Clock>,
    transport: Arc<dyn BleTransport>,
    id: PeripheralId,
    state: Arc<watch::Sender<LinkState>>,
) {
    while let Some(item) = frames.next().await {
        let frame = match item {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Monitoring error, frame dropped");
                continue;
            }
        };

        match decode_frame(&frame) {
            Ok(bpm) => {
                debug!(bpm, "Heart rate value");
                if readings.send(Reading::new(bpm, clock.now())).await.is_err() {
                    debug!("Reading subscriber went away, stopping pump");
                    return;
                }
            }
            Err(e) => warn!(error = %e, "Dropping malformed frame"),
        }
    }

    info!(%id, "Sensor notification stream ended");
    if let Err(e) = transport.disconnect(&id).await {
        warn!(%id, error = %e, "Error disconnecting device after stream end");
    }
    state.send_replace(LinkState::Disconnected);
}

// =============================================================================
// CANCELLATION
// =============================================================================

/// Stops a discovery in flight without holding the [`DeviceLink`].
///
/// A cancel only affects discoveries that started before it; the next one
/// runs normally.
#[derive(Debug, Clone)]
pub struct ScanCanceller {
    epoch: Arc<watch::Sender<u64>>,
}

impl ScanCanceller {
    /// Make the running discovery return [`LinkError::DiscoveryCancelled`].
    pub fn cancel(&self) {
        self.epoch.send_modify(|epoch| *epoch = epoch.wrapping_add(1));
    }
}

// =============================================================================
// DEVICE LINK
// =============================================================================

/// Discovery, connection and streaming for one sensor.
pub struct DeviceLink {
    transport: Arc<dyn BleTransport>,
    permissions: Arc<dyn PermissionGate>,
    clock: Arc<dyn Clock>,
    config: LinkConfig,
    state: Arc<watch::Sender<LinkState>>,
    cancel: Arc<watch::Sender<u64>>,
    permission: Option<PermissionStatus>,
    peripheral: Option<Peripheral>,
    scanning: bool,
    pump: Option<AbortHandle>,
}

impl DeviceLink {
    /// Create an idle link.
    pub fn new(
        transport: Arc<dyn BleTransport>,
        permissions: Arc<dyn PermissionGate>,
        clock: Arc<dyn Clock>,
        config: LinkConfig,
    ) -> Self {
        let (state, _) = watch::channel(LinkState::Idle);
        let (cancel, _) = watch::channel(0);
        Self {
            transport,
            permissions,
            clock,
            config,
            state: Arc::new(state),
            cancel: Arc::new(cancel),
            permission: None,
            peripheral: None,
            scanning: false,
            pump: None,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Follow state changes, including the stream ending on its own.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    /// The attached sensor, if any.
    #[must_use]
    pub const fn peripheral(&self) -> Option<&Peripheral> {
        self.peripheral.as_ref()
    }

    /// Link settings.
    #[must_use]
    pub const fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Handle that aborts a discovery in flight.
    #[must_use]
    pub fn canceller(&self) -> ScanCanceller {
        ScanCanceller {
            epoch: Arc::clone(&self.cancel),
        }
    }

    /// Snapshot for status reporting.
    #[must_use]
    pub fn status(&self) -> LinkStatus {
        let state = self.state();
        let mut peripheral = self.peripheral.clone();
        if let Some(p) = peripheral.as_mut().filter(|_| state == LinkState::Disconnected) {
            p.state = PeripheralState::Disconnected;
        }
        LinkStatus { state, peripheral }
    }

    /// Ask the platform for Bluetooth access and remember the answer.
    pub async fn request_capability_access(&mut self) -> PermissionStatus {
        let status = self.permissions.request_capability_access().await;
        match status {
            PermissionStatus::Granted => debug!("Bluetooth permissions granted"),
            PermissionStatus::Denied => warn!("Bluetooth permissions not granted"),
        }
        self.permission = Some(status);
        status
    }

    /// Scan for `filter`, stop at the first match and connect to it.
    ///
    /// # Errors
    ///
    /// - [`LinkError::PermissionDenied`] unless access was granted first
    /// - [`LinkError::Busy`] if a scan or connection is already active
    /// - [`LinkError::DiscoveryTimeout`] / [`LinkError::NoMatchingDevice`] if
    ///   nothing matched
    /// - [`LinkError::DiscoveryCancelled`] if a [`ScanCanceller`] fired
    /// - any error from [`connect`](Self::connect)
    pub async fn start_discovery(&mut self, filter: &str) -> LinkResult<Peripheral> {
        let epoch = *self.cancel.borrow();
        self.discover_and_connect(filter, epoch).await
    }

    async fn discover_and_connect(&mut self, filter: &str, epoch: u64) -> LinkResult<Peripheral> {
        self.reconcile();
        if self.permission != Some(PermissionStatus::Granted) {
            return Err(LinkError::PermissionDenied);
        }
        let state = self.state();
        if state.is_active() {
            return Err(LinkError::Busy { state });
        }

        let found = self.discover(filter, epoch).await?;
        self.connect(&found.id).await?;

        self.peripheral.clone().ok_or(LinkError::NotConnected)
    }

    async fn discover(&mut self, filter: &str, epoch: u64) -> LinkResult<Peripheral> {
        self.set_state(LinkState::Scanning);
        let mut scan = match self.transport.start_scan().await {
            Ok(scan) => scan,
            Err(e) => {
                warn!(error = %e, "Failed to start scan");
                self.set_state(LinkState::Failed);
                return Err(e);
            }
        };
        self.scanning = true;

        let timeout = self.config.discovery_timeout;
        info!(
            device_name = filter,
            timeout_secs = timeout.as_secs(),
            "Scanning for sensor"
        );

        let search = async {
            while let Some(item) = scan.next().await {
                match item {
                    Ok(ad) if ad.name.as_deref() == Some(filter) => return Ok(ad),
                    Ok(ad) => debug!(id = %ad.id, name = ?ad.name, "Ignoring device"),
                    Err(e) => {
                        return Err(LinkError::DiscoveryFailed {
                            message: e.to_string(),
                        })
                    }
                }
            }
            Err(LinkError::NoMatchingDevice {
                name: filter.to_string(),
            })
        };
        let mut cancelled = self.cancel.subscribe();
        let outcome = tokio::select! {
            outcome = tokio::time::timeout(timeout, search) => Some(outcome),
            () = async {
                let _ = cancelled.wait_for(|current| *current != epoch).await;
            } => None,
        };
        drop(scan);
        self.stop_scan().await;

        let Some(outcome) = outcome else {
            info!("Discovery cancelled");
            self.set_state(LinkState::Idle);
            return Err(LinkError::DiscoveryCancelled);
        };

        match outcome {
            Ok(Ok(ad)) => {
                info!(id = %ad.id, "Found sensor");
                let peripheral = Peripheral {
                    id: ad.id,
                    name: ad.name.unwrap_or_default(),
                    state: PeripheralState::Discovered,
                };
                self.peripheral = Some(peripheral.clone());
                self.set_state(LinkState::Found);
                Ok(peripheral)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Discovery ended without a sensor");
                let next = if matches!(e, LinkError::NoMatchingDevice { .. }) {
                    LinkState::Idle
                } else {
                    LinkState::Failed
                };
                self.set_state(next);
                Err(e)
            }
            Err(_) => {
                warn!(timeout_secs = timeout.as_secs(), "Discovery timed out");
                self.set_state(LinkState::Idle);
                Err(LinkError::DiscoveryTimeout {
                    duration_secs: timeout.as_secs(),
                })
            }
        }
    }

    async fn stop_scan(&mut self) {
        if !self.scanning {
            return;
        }
        self.scanning = false;
        if let Err(e) = self.transport.stop_scan().await {
            warn!(error = %e, "Failed to stop scan");
        }
    }

    /// Connect to `id` and verify it exposes the heart rate characteristic.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::ConnectionFailed`] or
    /// [`LinkError::CharacteristicNotFound`]; the link is left
    /// `Disconnected` either way and discovery can be re-run.
    pub async fn connect(&mut self, id: &PeripheralId) -> LinkResult<()> {
        let name = self
            .peripheral
            .as_ref()
            .filter(|p| &p.id == id)
            .map_or_else(|| id.to_string(), |p| p.name.clone());
        self.peripheral = Some(Peripheral {
            id: id.clone(),
            name,
            state: PeripheralState::Connecting,
        });
        self.set_state(LinkState::Connecting);
        info!(%id, "Connecting to device");

        if let Err(e) = self.transport.connect(id).await {
            warn!(%id, error = %e, "Connection error");
            self.mark_disconnected();
            return Err(match e {
                LinkError::ConnectionFailed { .. } => e,
                other => LinkError::ConnectionFailed {
                    id: id.to_string(),
                    message: other.to_string(),
                },
            });
        }
        info!(%id, "Successfully connected");

        let services = match self.transport.discover_services(id).await {
            Ok(services) => services,
            Err(e) => {
                warn!(%id, error = %e, "Service discovery failed");
                self.release_connection(id).await;
                return Err(LinkError::ConnectionFailed {
                    id: id.to_string(),
                    message: e.to_string(),
                });
            }
        };
        debug!(%id, services = services.len(), "Services and characteristics discovered");

        let service = self.config.service_uuid;
        let characteristic = self.config.characteristic_uuid;
        let supported = services
            .iter()
            .any(|s| s.uuid == service && s.has_characteristic(characteristic));
        if !supported {
            warn!(%id, %service, %characteristic, "Sensor lacks heart rate characteristic");
            self.release_connection(id).await;
            return Err(LinkError::CharacteristicNotFound {
                service,
                characteristic,
            });
        }

        if let Some(peripheral) = self.peripheral.as_mut() {
            peripheral.state = PeripheralState::Connected;
        }
        self.set_state(LinkState::Connected);
        Ok(())
    }

    async fn release_connection(&mut self, id: &PeripheralId) {
        if let Err(e) = self.transport.disconnect(id).await {
            warn!(%id, error = %e, "Error disconnecting device");
        }
        self.mark_disconnected();
    }

    /// Subscribe to notifications on the connected sensor.
    ///
    /// Frames are decoded in arrival order; malformed ones are logged and
    /// dropped.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::NotConnected`] without a verified connection, or
    /// the transport's error if notifications cannot be enabled.
    pub async fn subscribe(
        &mut self,
        service: Uuid,
        characteristic: Uuid,
    ) -> LinkResult<ReadingSubscription> {
        self.reconcile();
        let id = self
            .peripheral
            .as_ref()
            .filter(|p| p.state == PeripheralState::Connected)
            .map(|p| p.id.clone())
            .ok_or(LinkError::NotConnected)?;

        if let Some(previous) = self.pump.take() {
            previous.abort();
        }

        let frames = self
            .transport
            .monitor(&id, service, characteristic)
            .await
            .map_err(|e| match e {
                LinkError::SubscriptionFailed { .. } | LinkError::CharacteristicNotFound { .. } => e,
                other => LinkError::SubscriptionFailed {
                    message: other.to_string(),
                },
            })?;

        let (tx, rx) = mpsc::channel(self.config.reading_buffer.max(1));
        let pump = tokio::spawn(pump_frames(
            frames,
            tx,
            Arc::clone(&self.clock),
            Arc::clone(&self.transport),
            id.clone(),
            Arc::clone(&self.state),
        ));
        self.pump = Some(pump.abort_handle());
        self.set_state(LinkState::Streaming);
        info!(%id, %characteristic, "Monitoring started for heart rate characteristic");

        Ok(ReadingSubscription {
            readings: rx,
            pump,
        })
    }

    /// Permission check, discovery, connection and subscription in one go.
    ///
    /// A failed subscription closes the connection again, leaving the link
    /// ready for another attempt.
    ///
    /// # Errors
    ///
    /// Returns the first failing step's error.
    pub async fn establish(&mut self) -> LinkResult<ReadingSubscription> {
        let epoch = *self.cancel.borrow();
        if self.request_capability_access().await == PermissionStatus::Denied {
            return Err(LinkError::PermissionDenied);
        }
        let name = self.config.device_name.clone();
        let peripheral = self.discover_and_connect(&name, epoch).await?;

        match self
            .subscribe(self.config.service_uuid, self.config.characteristic_uuid)
            .await
        {
            Ok(subscription) => Ok(subscription),
            Err(e) => {
                warn!(id = %peripheral.id, error = %e, "Subscription failed, releasing sensor");
                self.release_connection(&peripheral.id).await;
                Err(e)
            }
        }
    }

    /// Stop the scan, the subscription and the connection.
    ///
    /// Safe to call in any state and more than once.
    pub async fn teardown(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.reconcile();
        self.stop_scan().await;

        if let Some(peripheral) = self.peripheral.take() {
            if matches!(
                peripheral.state,
                PeripheralState::Connecting | PeripheralState::Connected
            ) {
                if let Err(e) = self.transport.disconnect(&peripheral.id).await {
                    warn!(id = %peripheral.id, error = %e, "Error disconnecting device during cleanup");
                }
                info!(id = %peripheral.id, "Sensor disconnected");
            }
        }
        self.set_state(LinkState::Disconnected);
    }

    /// Catch up with a notification stream that ended on its own. The pump
    /// already closed the connection.
    fn reconcile(&mut self) {
        if self.state() != LinkState::Disconnected {
            return;
        }
        if let Some(peripheral) = self.peripheral.as_mut() {
            if peripheral.state == PeripheralState::Connected {
                debug!(id = %peripheral.id, "Sensor stream ended earlier, connection already closed");
                peripheral.state = PeripheralState::Disconnected;
                self.pump = None;
            }
        }
    }

    fn mark_disconnected(&mut self) {
        if let Some(peripheral) = self.peripheral.as_mut() {
            peripheral.state = PeripheralState::Disconnected;
        }
        self.set_state(LinkState::Disconnected);
    }

    fn set_state(&self, next: LinkState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = %previous, to = %next, "Link state changed");
        }
    }
}

impl Drop for DeviceLink {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.reconcile();

        let connected = self
            .peripheral
            .take()
            .filter(|p| {
                matches!(
                    p.state,
                    PeripheralState::Connecting | PeripheralState::Connected
                )
            })
            .map(|p| p.id);
        let scanning = self.scanning;
        if !scanning && connected.is_none() {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("Device link dropped outside a runtime; radio resources not released");
            return;
        };
        let transport = Arc::clone(&self.transport);
        runtime.spawn(async move {
            if scanning {
                if let Err(e) = transport.stop_scan().await {
                    warn!(error = %e, "Failed to stop scan on drop");
                }
            }
            if let Some(id) = connected {
                if let Err(e) = transport.disconnect(&id).await {
                    warn!(%id, error = %e, "Error disconnecting device on drop");
                }
            }
        });
    }
}
