//! BlueZ transport built on `bluer`.

use std::pin::pin;
use std::time::Duration;

use async_trait::async_trait;
use bluer::gatt::remote::Characteristic;
use bluer::{Adapter, AdapterEvent, Address, Device, DeviceEvent, DeviceProperty, Session};
use futures::{stream, Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    Advertisement, AdvertisementStream, BleTransport, Frame, FrameStream, LinkError, LinkResult,
    PeripheralId, ServiceDescriptor,
};

/// Polls before giving up on GATT service resolution.
const SERVICE_RESOLVE_ATTEMPTS: u32 = 40;

/// Delay between service resolution polls.
const SERVICE_RESOLVE_INTERVAL: Duration = Duration::from_millis(250);

/// Transport backed by the system Bluetooth daemon.
pub struct BluezTransport {
    _session: Session,
    adapter: Adapter,
}

impl BluezTransport {
    /// Open a session on the default adapter, powering it on if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if BlueZ is unreachable or no adapter can be powered.
    pub async fn new() -> LinkResult<Self> {
        let session = Session::new()
            .await
            .map_err(|e| LinkError::SessionInitFailed {
                message: e.to_string(),
            })?;
        let adapter = session
            .default_adapter()
            .await
            .map_err(|_| LinkError::AdapterNotFound)?;

        if !adapter.is_powered().await.map_err(internal)? {
            info!(adapter = adapter.name(), "Powering on Bluetooth adapter");
            adapter
                .set_powered(true)
                .await
                .map_err(|_| LinkError::AdapterPoweredOff)?;
        }
        info!(adapter = adapter.name(), "Using Bluetooth adapter");

        Ok(Self {
            _session: session,
            adapter,
        })
    }

    fn device(&self, id: &PeripheralId) -> LinkResult<Device> {
        let address: Address = id.as_str().parse().map_err(|_| LinkError::InvalidAddress {
            address: id.to_string(),
        })?;
        self.adapter.device(address).map_err(internal)
    }

    async fn wait_for_services(device: &Device) -> LinkResult<()> {
        for _ in 0..SERVICE_RESOLVE_ATTEMPTS {
            if device.is_services_resolved().await.map_err(internal)? {
                return Ok(());
            }
            tokio::time::sleep(SERVICE_RESOLVE_INTERVAL).await;
        }
        Err(LinkError::Internal {
            message: "timed out waiting for GATT services".to_string(),
        })
    }

    async fn find_characteristic(
        device: &Device,
        service: Uuid,
        characteristic: Uuid,
    ) -> LinkResult<Characteristic> {
        for remote_service in device.services().await.map_err(internal)? {
            if remote_service.uuid().await.map_err(internal)? != service {
                continue;
            }
            for remote_char in remote_service.characteristics().await.map_err(internal)? {
                if remote_char.uuid().await.map_err(internal)? == characteristic {
                    return Ok(remote_char);
                }
            }
        }
        Err(LinkError::CharacteristicNotFound {
            service,
            characteristic,
        })
    }
}

#[async_trait]
impl BleTransport for BluezTransport {
    async fn start_scan(&self) -> LinkResult<AdvertisementStream> {
        let events = self
            .adapter
            .discover_devices()
            .await
            .map_err(|e| LinkError::DiscoveryFailed {
                message: e.to_string(),
            })?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(relay_discovery(self.adapter.clone(), events, tx));

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|ad| (Ok(ad), rx))
        })
        .boxed())
    }

    async fn stop_scan(&self) -> LinkResult<()> {
        // Dropping the advertisement stream ends the relay, which drops the
        // BlueZ discovery session.
        debug!("Discovery session released");
        Ok(())
    }

    async fn connect(&self, id: &PeripheralId) -> LinkResult<()> {
        let device = self.device(id)?;
        if device.is_connected().await.map_err(internal)? {
            return Ok(());
        }
        device
            .connect()
            .await
            .map_err(|e| LinkError::ConnectionFailed {
                id: id.to_string(),
                message: e.to_string(),
            })
    }

    async fn discover_services(&self, id: &PeripheralId) -> LinkResult<Vec<ServiceDescriptor>> {
        let device = self.device(id)?;
        Self::wait_for_services(&device).await?;

        let mut descriptors = Vec::new();
        for service in device.services().await.map_err(internal)? {
            let uuid = service.uuid().await.map_err(internal)?;
            let mut characteristics = Vec::new();
            for characteristic in service.characteristics().await.map_err(internal)? {
                characteristics.push(characteristic.uuid().await.map_err(internal)?);
            }
            descriptors.push(ServiceDescriptor {
                uuid,
                characteristics,
            });
        }
        Ok(descriptors)
    }

    async fn monitor(
        &self,
        id: &PeripheralId,
        service: Uuid,
        characteristic: Uuid,
    ) -> LinkResult<FrameStream> {
        let device = self.device(id)?;
        let remote = Self::find_characteristic(&device, service, characteristic).await?;
        let notifications = remote
            .notify()
            .await
            .map_err(|e| LinkError::SubscriptionFailed {
                message: e.to_string(),
            })?;

        Ok(notifications
            .map(|bytes| Ok(Frame::from_bytes(&bytes)))
            .boxed())
    }

    async fn disconnect(&self, id: &PeripheralId) -> LinkResult<()> {
        let device = self.device(id)?;
        device.disconnect().await.map_err(internal)
    }
}

/// Forward discovered devices until the advertisement stream is dropped.
///
/// Sensors often show up before BlueZ has read their name. Those are
/// reported unnamed right away and again once the name arrives.
async fn relay_discovery(
    adapter: Adapter,
    events: impl Stream<Item = AdapterEvent>,
    tx: mpsc::UnboundedSender<Advertisement>,
) {
    let mut events = pin!(events);
    loop {
        let event = tokio::select! {
            () = tx.closed() => break,
            event = events.next() => event,
        };
        let Some(event) = event else { break };
        let AdapterEvent::DeviceAdded(address) = event else {
            continue;
        };
        let Ok(device) = adapter.device(address) else {
            continue;
        };

        let name = device.name().await.ok().flatten();
        let unnamed = name.is_none();
        if tx.send(advertisement(address, name)).is_err() {
            break;
        }
        if unnamed {
            tokio::spawn(watch_for_name(device, tx.clone()));
        }
    }
    debug!("Discovery relay stopped");
}

/// Report `device` again when its name property changes.
async fn watch_for_name(device: Device, tx: mpsc::UnboundedSender<Advertisement>) {
    let Ok(changes) = device.events().await else {
        return;
    };
    let mut changes = pin!(changes);
    loop {
        let change = tokio::select! {
            () = tx.closed() => return,
            change = changes.next() => change,
        };
        let Some(change) = change else { return };
        if let Some(name) = learned_name(change) {
            debug!(address = %device.address(), %name, "Device name resolved");
            let _ = tx.send(advertisement(device.address(), Some(name)));
            return;
        }
    }
}

fn learned_name(event: DeviceEvent) -> Option<String> {
    match event {
        DeviceEvent::PropertyChanged(DeviceProperty::Name(name)) => Some(name),
        _ => None,
    }
}

fn advertisement(address: Address, name: Option<String>) -> Advertisement {
    Advertisement {
        id: PeripheralId::new(address.to_string()),
        name,
    }
}

fn internal(e: bluer::Error) -> LinkError {
    LinkError::Internal {
        message: e.to_string(),
    }
}
