//! # hikesense-server
//!
//! HTTP daemon for the HikeSense hiking companion.
//!
//! This binary provides:
//! - REST API for the sensor link, live telemetry and hike sessions
//! - OpenAPI documentation via Swagger UI
//! - Structured logging to file and stdout
//!
//! ## Running
//!
//! ```bash
//! # Development, with a simulated sensor
//! cargo run --package hikesense-server --features mock-bluetooth
//!
//! # Production (BlueZ)
//! ./hikesense-server
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::Context;
use hikesense_core::bluetooth::BleTransport;
use hikesense_core::HikeSenseConfig;
use hikesense_server::state::{AppState, Services};
use hikesense_server::{api, logging};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = HikeSenseConfig::load().context("Failed to load configuration")?;

    let log_target = logging::init(&config.server)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        logs = ?log_target,
        "Starting hikesense-server"
    );

    let ip: IpAddr = config
        .server
        .bind_address
        .parse()
        .with_context(|| format!("Invalid bind address '{}'", config.server.bind_address))?;
    let addr = SocketAddr::new(ip, config.server.port);

    let transport = open_transport().await;
    let services = Services::from_config(&config, transport)?;
    let state = AppState::new(config, services).shared();

    let app = api::create_router(Arc::clone(&state));

    let listener = TcpListener::bind(addr).await?;

    info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Releasing sensor");
    state.write().await.shutdown().await;

    Ok(())
}

#[cfg(all(feature = "bluetooth", not(feature = "mock-bluetooth")))]
async fn open_transport() -> Option<Arc<dyn BleTransport>> {
    match hikesense_core::BluezTransport::new().await {
        Ok(transport) => Some(Arc::new(transport) as Arc<dyn BleTransport>),
        Err(e) => {
            error!(error = %e, "Failed to open Bluetooth adapter");
            None
        }
    }
}

#[cfg(feature = "mock-bluetooth")]
async fn open_transport() -> Option<Arc<dyn BleTransport>> {
    use hikesense_core::bluetooth::mock::{MockPeripheral, MockTransport};

    let sensor = MockPeripheral::heart_rate_sensor("02:00:00:48:53:42");
    let id = sensor.id().clone();
    let transport = Arc::new(MockTransport::new().with_peripheral(sensor));
    tracing::warn!(%id, "Using simulated heart rate sensor");

    tokio::spawn(simulate_heart_rate(Arc::clone(&transport), id));
    Some(transport as Arc<dyn BleTransport>)
}

#[cfg(not(any(feature = "bluetooth", feature = "mock-bluetooth")))]
async fn open_transport() -> Option<Arc<dyn BleTransport>> {
    tracing::warn!("Built without Bluetooth support");
    None
}

/// Feed the simulated sensor one reading per second while it is connected.
#[cfg(feature = "mock-bluetooth")]
async fn simulate_heart_rate(
    transport: Arc<hikesense_core::bluetooth::mock::MockTransport>,
    id: hikesense_core::bluetooth::PeripheralId,
) {
    let frames = transport.frame_sender();
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
    let mut beat: u16 = 0;
    loop {
        ticker.tick().await;
        if transport.is_connected(&id) {
            frames.send_bpm(72 + beat % 24);
            beat = beat.wrapping_add(1);
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, shutting down"),
        () = terminate => info!("Received termination signal, shutting down"),
    }
}
