//! Sensor link failures and the reconnects that follow them.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tokio::sync::Mutex;

use hikesense_core::bluetooth::mock::{MockPeripheral, MockPermissions, MockTransport};
use hikesense_core::bluetooth::{DeviceLink, LinkConfig, LinkError, LinkState, PeripheralId};
use hikesense_core::clock::ManualClock;

const SENSOR: &str = "C8:2E:18:4A:90:11";

fn link(transport: &Arc<MockTransport>) -> DeviceLink {
    DeviceLink::new(
        Arc::clone(transport) as _,
        Arc::new(MockPermissions::granted()),
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap(),
        )),
        LinkConfig::default(),
    )
}

#[tokio::test]
async fn refused_notifications_release_the_sensor_until_retry() {
    let transport =
        Arc::new(MockTransport::new().with_peripheral(MockPeripheral::heart_rate_sensor(SENSOR)));
    let frames = transport.frame_sender();
    let mut link = link(&transport);
    let id = PeripheralId::new(SENSOR);

    transport.refuse_monitor(true);
    let err = link.establish().await.unwrap_err();
    assert!(matches!(err, LinkError::SubscriptionFailed { .. }));
    assert!(!transport.is_connected(&id));
    assert_eq!(transport.disconnect_count(), 1);
    assert_eq!(link.state(), LinkState::Disconnected);

    transport.refuse_monitor(false);
    let mut subscription = link.establish().await.unwrap();
    assert_eq!(link.state(), LinkState::Streaming);

    frames.send_bpm(74);
    assert_eq!(subscription.next_reading().await.map(|r| r.bpm), Some(74));
    link.teardown().await;
}

#[tokio::test]
async fn sensor_dropping_out_can_be_reconnected() {
    let transport =
        Arc::new(MockTransport::new().with_peripheral(MockPeripheral::heart_rate_sensor(SENSOR)));
    let frames = transport.frame_sender();
    let mut link = link(&transport);
    let id = PeripheralId::new(SENSOR);

    let mut first = link.establish().await.unwrap();
    frames.send_bpm(88);
    frames.close();
    assert_eq!(first.next_reading().await.map(|r| r.bpm), Some(88));
    assert!(first.next_reading().await.is_none());

    link.watch_state()
        .wait_for(|s| *s == LinkState::Disconnected)
        .await
        .unwrap();
    assert!(!transport.is_connected(&id));

    let mut second = link.establish().await.unwrap();
    assert!(transport.is_connected(&id));
    frames.send_bpm(91);
    assert_eq!(second.next_reading().await.map(|r| r.bpm), Some(91));

    link.teardown().await;
    assert!(!transport.is_connected(&id));
    assert!(second.next_reading().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn cancelled_discovery_frees_the_link() {
    let transport = Arc::new(
        MockTransport::new().with_peripheral(MockPeripheral::new("11:22:33:44:55:66", Some("Watch"))),
    );
    let link = link(&transport);
    let canceller = link.canceller();
    let mut states = link.watch_state();
    let link = Arc::new(Mutex::new(link));

    let connecting = {
        let link = Arc::clone(&link);
        tokio::spawn(async move { link.lock().await.establish().await.map(|_| ()) })
    };
    states.wait_for(|s| *s == LinkState::Scanning).await.unwrap();

    canceller.cancel();
    let outcome = tokio::time::timeout(Duration::from_secs(1), connecting)
        .await
        .expect("discovery kept running after cancel")
        .unwrap();
    assert!(matches!(outcome, Err(LinkError::DiscoveryCancelled)));
    assert!(!transport.is_scanning());

    let mut link = tokio::time::timeout(Duration::from_secs(1), link.lock())
        .await
        .expect("link still held after cancel");
    link.teardown().await;
    assert_eq!(link.state(), LinkState::Disconnected);
}
