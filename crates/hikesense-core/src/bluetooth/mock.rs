//! In-memory BLE transport.
//!
//! [`MockTransport`] advertises a scripted list of peripherals and delivers
//! frames pushed through a [`FrameSender`]. It records what the link did to
//! it (scans started, connections open, disconnects) so tests can assert on
//! resource cleanup.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::stream::{self, StreamExt};
use tracing::debug;
use uuid::Uuid;

use super::{
    Advertisement, AdvertisementStream, BleTransport, Frame, FrameStream, LinkError, LinkResult,
    PeripheralId, PermissionGate, PermissionStatus, ServiceDescriptor, HEART_RATE_CHARACTERISTIC_UUID,
    HEART_RATE_SERVICE_UUID, SENSOR_NAME,
};

/// A scripted peripheral.
#[derive(Debug, Clone)]
pub struct MockPeripheral {
    id: PeripheralId,
    name: Option<String>,
    services: Vec<ServiceDescriptor>,
}

impl MockPeripheral {
    /// A peripheral with no GATT services.
    #[must_use]
    pub fn new(id: &str, name: Option<&str>) -> Self {
        Self {
            id: PeripheralId::new(id),
            name: name.map(str::to_string),
            services: Vec::new(),
        }
    }

    /// A peripheral that looks like the HikeSense wearable.
    #[must_use]
    pub fn heart_rate_sensor(id: &str) -> Self {
        Self::new(id, Some(SENSOR_NAME)).with_service(
            HEART_RATE_SERVICE_UUID,
            vec![HEART_RATE_CHARACTERISTIC_UUID],
        )
    }

    /// Add a GATT service.
    #[must_use]
    pub fn with_service(mut self, uuid: Uuid, characteristics: Vec<Uuid>) -> Self {
        self.services.push(ServiceDescriptor {
            uuid,
            characteristics,
        });
        self
    }

    /// Identifier this peripheral advertises under.
    #[must_use]
    pub const fn id(&self) -> &PeripheralId {
        &self.id
    }
}

#[derive(Debug)]
struct MockState {
    peripherals: Vec<MockPeripheral>,
    finite_scan: bool,
    scan_error: Option<String>,
    refuse_connections: bool,
    refuse_monitor: bool,
    scanning: bool,
    scans_started: usize,
    connected: HashSet<PeripheralId>,
    disconnects: usize,
    frames: Option<UnboundedReceiver<LinkResult<Frame>>>,
}

/// Handle for pushing notifications into a [`MockTransport`].
///
/// Always targets the most recent monitor, so a handle taken before a
/// reconnect keeps working after it.
#[derive(Debug, Clone)]
pub struct FrameSender {
    tx: Arc<Mutex<UnboundedSender<LinkResult<Frame>>>>,
}

impl FrameSender {
    fn current(&self) -> UnboundedSender<LinkResult<Frame>> {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn replace(&self, tx: UnboundedSender<LinkResult<Frame>>) {
        *self.tx.lock().unwrap_or_else(PoisonError::into_inner) = tx;
    }

    /// Deliver a raw frame.
    pub fn send(&self, frame: Frame) {
        if self.current().unbounded_send(Ok(frame)).is_err() {
            debug!("Mock frame dropped, monitor already closed");
        }
    }

    /// Deliver a heart rate value encoded the way the sensor does.
    pub fn send_bpm(&self, bpm: u16) {
        self.send(Frame::heart_rate(bpm));
    }

    /// Deliver a notification error.
    pub fn fail(&self, message: &str) {
        let _ = self.current().unbounded_send(Err(LinkError::Internal {
            message: message.to_string(),
        }));
    }

    /// End the notification stream, as if the sensor went away.
    pub fn close(&self) {
        self.current().close_channel();
    }
}

/// Scripted BLE transport.
#[derive(Debug)]
pub struct MockTransport {
    state: Mutex<MockState>,
    frames: FrameSender,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// A transport with no peripherals whose scans never end on their own.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            state: Mutex::new(MockState {
                peripherals: Vec::new(),
                finite_scan: false,
                scan_error: None,
                refuse_connections: false,
                refuse_monitor: false,
                scanning: false,
                scans_started: 0,
                connected: HashSet::new(),
                disconnects: 0,
                frames: Some(rx),
            }),
            frames: FrameSender {
                tx: Arc::new(Mutex::new(tx)),
            },
        }
    }

    /// Advertise `peripheral` on every scan, in insertion order.
    #[must_use]
    pub fn with_peripheral(self, peripheral: MockPeripheral) -> Self {
        self.lock().peripherals.push(peripheral);
        self
    }

    /// End each scan once all peripherals have advertised.
    #[must_use]
    pub fn finite_scan(self) -> Self {
        self.lock().finite_scan = true;
        self
    }

    /// Fail each scan after advertising with `message`.
    #[must_use]
    pub fn with_scan_error(self, message: &str) -> Self {
        self.lock().scan_error = Some(message.to_string());
        self
    }

    /// Make `connect` fail until switched back.
    pub fn refuse_connections(&self, refuse: bool) {
        self.lock().refuse_connections = refuse;
    }

    /// Make `monitor` fail until switched back.
    pub fn refuse_monitor(&self, refuse: bool) {
        self.lock().refuse_monitor = refuse;
    }

    /// Handle for injecting notifications.
    #[must_use]
    pub fn frame_sender(&self) -> FrameSender {
        self.frames.clone()
    }

    /// Whether a scan is running.
    #[must_use]
    pub fn is_scanning(&self) -> bool {
        self.lock().scanning
    }

    /// Number of scans started so far.
    #[must_use]
    pub fn scans_started(&self) -> usize {
        self.lock().scans_started
    }

    /// Whether `id` has an open connection.
    #[must_use]
    pub fn is_connected(&self, id: &PeripheralId) -> bool {
        self.lock().connected.contains(id)
    }

    /// Number of disconnects performed.
    #[must_use]
    pub fn disconnect_count(&self) -> usize {
        self.lock().disconnects
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl BleTransport for MockTransport {
    async fn start_scan(&self) -> LinkResult<AdvertisementStream> {
        let mut state = self.lock();
        state.scanning = true;
        state.scans_started += 1;

        let mut items: Vec<LinkResult<Advertisement>> = state
            .peripherals
            .iter()
            .map(|p| {
                Ok(Advertisement {
                    id: p.id.clone(),
                    name: p.name.clone(),
                })
            })
            .collect();
        if let Some(message) = &state.scan_error {
            items.push(Err(LinkError::DiscoveryFailed {
                message: message.clone(),
            }));
        }

        let advertisements = stream::iter(items);
        Ok(if state.finite_scan {
            advertisements.boxed()
        } else {
            advertisements.chain(stream::pending()).boxed()
        })
    }

    async fn stop_scan(&self) -> LinkResult<()> {
        self.lock().scanning = false;
        Ok(())
    }

    async fn connect(&self, id: &PeripheralId) -> LinkResult<()> {
        let mut state = self.lock();
        if state.refuse_connections {
            return Err(LinkError::ConnectionFailed {
                id: id.to_string(),
                message: "connection refused".to_string(),
            });
        }
        if !state.peripherals.iter().any(|p| &p.id == id) {
            return Err(LinkError::ConnectionFailed {
                id: id.to_string(),
                message: "unknown peripheral".to_string(),
            });
        }
        state.connected.insert(id.clone());
        Ok(())
    }

    async fn discover_services(&self, id: &PeripheralId) -> LinkResult<Vec<ServiceDescriptor>> {
        let state = self.lock();
        if !state.connected.contains(id) {
            return Err(LinkError::NotConnected);
        }
        Ok(state
            .peripherals
            .iter()
            .find(|p| &p.id == id)
            .map(|p| p.services.clone())
            .unwrap_or_default())
    }

    async fn monitor(
        &self,
        id: &PeripheralId,
        service: Uuid,
        characteristic: Uuid,
    ) -> LinkResult<FrameStream> {
        let mut state = self.lock();
        if !state.connected.contains(id) {
            return Err(LinkError::NotConnected);
        }
        let exposes = state
            .peripherals
            .iter()
            .filter(|p| &p.id == id)
            .flat_map(|p| &p.services)
            .any(|s| s.uuid == service && s.has_characteristic(characteristic));
        if !exposes {
            return Err(LinkError::CharacteristicNotFound {
                service,
                characteristic,
            });
        }
        if state.refuse_monitor {
            return Err(LinkError::SubscriptionFailed {
                message: "notifications refused".to_string(),
            });
        }

        // Frames queued before the first monitor are delivered to it; every
        // later monitor gets a fresh channel.
        let frames = state.frames.take().unwrap_or_else(|| {
            let (tx, rx) = unbounded();
            self.frames.replace(tx);
            rx
        });
        Ok(frames.boxed())
    }

    async fn disconnect(&self, id: &PeripheralId) -> LinkResult<()> {
        let mut state = self.lock();
        if state.connected.remove(id) {
            state.disconnects += 1;
        }
        Ok(())
    }
}

/// Permission gate with a switchable answer.
#[derive(Debug)]
pub struct MockPermissions {
    granted: AtomicBool,
    requests: AtomicUsize,
}

impl MockPermissions {
    /// Grants every request.
    #[must_use]
    pub const fn granted() -> Self {
        Self {
            granted: AtomicBool::new(true),
            requests: AtomicUsize::new(0),
        }
    }

    /// Denies every request.
    #[must_use]
    pub const fn denied() -> Self {
        Self {
            granted: AtomicBool::new(false),
            requests: AtomicUsize::new(0),
        }
    }

    /// Change the answer for later requests.
    pub fn set_granted(&self, granted: bool) {
        self.granted.store(granted, Ordering::SeqCst);
    }

    /// Number of requests made.
    #[must_use]
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PermissionGate for MockPermissions {
    async fn request_capability_access(&self) -> PermissionStatus {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if self.granted.load(Ordering::SeqCst) {
            PermissionStatus::Granted
        } else {
            PermissionStatus::Denied
        }
    }
}
