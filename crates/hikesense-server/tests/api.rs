//! HTTP-level tests against the full router with simulated collaborators.

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum_test::TestServer;
use chrono::{TimeZone, Utc};
use serde_json::{json, Value};
use tokio_test::assert_ok;

use hikesense_core::backend::{RecordingBackend, StaticDirections};
use hikesense_core::bluetooth::mock::{MockPeripheral, MockPermissions, MockTransport};
use hikesense_core::bluetooth::{BleTransport, PeripheralId};
use hikesense_core::clock::ManualClock;
use hikesense_core::HikeSenseConfig;
use hikesense_server::api::create_router;
use hikesense_server::state::{AppState, Services};

const SENSOR: &str = "C8:2E:18:4A:90:11";
const ROUTE: &str = "_p~iF~ps|U_ulLnnqC_mqNvxq`@";

struct Harness {
    server: TestServer,
    transport: Arc<MockTransport>,
    backend: Arc<RecordingBackend>,
    clock: Arc<ManualClock>,
}

fn harness() -> Harness {
    let transport = Arc::new(
        MockTransport::new().with_peripheral(MockPeripheral::heart_rate_sensor(SENSOR)),
    );
    build(Some(Arc::clone(&transport) as Arc<dyn BleTransport>), transport)
}

fn build(radio: Option<Arc<dyn BleTransport>>, transport: Arc<MockTransport>) -> Harness {
    let backend = Arc::new(RecordingBackend::new());
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap(),
    ));
    let services = Services {
        transport: radio,
        permissions: Arc::new(MockPermissions::granted()),
        backend: Arc::clone(&backend) as _,
        directions: Arc::new(StaticDirections::route(ROUTE)),
        clock: Arc::clone(&clock) as _,
    };
    let state = AppState::new(HikeSenseConfig::default(), services).shared();
    let server = TestServer::new(create_router(state)).unwrap();

    Harness {
        server,
        transport,
        backend,
        clock,
    }
}

fn ridge_loop() -> Value {
    json!({
        "name": "Ridge Loop",
        "startLocation": {"latitude": 38.5, "longitude": -120.2},
        "finishLocation": {"latitude": 43.252, "longitude": -126.453},
        "alerts": [],
        "difficulty": "hard"
    })
}

#[tokio::test]
async fn health_reports_ok() {
    let h = harness();

    let response = h.server.get("/health").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn hike_lifecycle_submits_record_with_extra_fields() {
    let h = harness();

    let response = h.server.post("/api/session/select").json(&ridge_loop()).await;
    response.assert_status_ok();
    let snapshot: Value = response.json();
    assert_eq!(snapshot["state"], "selected");
    assert_eq!(snapshot["route"].as_array().map(Vec::len), Some(3));

    h.server.post("/api/session/start").await.assert_status_ok();
    h.clock.advance_millis(5_400_000);

    let finished: Value = h.server.post("/api/session/finish").await.json();
    assert_eq!(finished["state"], "awaiting_favorite_decision");

    let response = h
        .server
        .post("/api/session/favourite")
        .json(&json!({"is_favourite": true}))
        .await;
    response.assert_status_ok();
    let report: Value = response.json();
    assert_eq!(report["delivery"]["status"], "accepted");
    assert_eq!(report["record"]["duration"], 5_400_000);
    assert_eq!(report["record"]["isFavourite"], true);
    assert_eq!(report["record"]["difficulty"], "hard");

    let sessions = h.backend.sessions();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].hike.name, "Ridge Loop");

    let completed: Value = h.server.get("/api/session").await.json();
    assert_eq!(completed["state"], "completed");
}

#[tokio::test]
async fn out_of_order_request_is_a_conflict() {
    let h = harness();

    let response = h.server.post("/api/session/finish").await;
    response.assert_status(StatusCode::CONFLICT);
    let body: Value = response.json();
    assert_eq!(body["error"], "invalid_transition");

    let response = h.server.post("/api/session/sos").await;
    response.assert_status(StatusCode::CONFLICT);
    assert!(h.backend.sos_calls().is_empty());
}

#[tokio::test]
async fn sos_carries_reported_location() {
    let h = harness();

    h.server
        .put("/api/location")
        .json(&json!({"location": {"latitude": 46.5, "longitude": 8.0}}))
        .await
        .assert_status_ok();
    h.server.post("/api/session/select").json(&ridge_loop()).await;
    h.server.post("/api/session/start").await;

    let response = h.server.post("/api/session/sos").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["confirmed"], true);

    let calls = h.backend.sos_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].location.map(|p| p.latitude), Some(46.5));
}

#[tokio::test]
async fn connect_streams_readings_until_disconnect() {
    let h = harness();
    let frames = h.transport.frame_sender();

    let response = h.server.post("/api/device/connect").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["state"], "streaming");
    assert_eq!(body["peripheral"]["id"], SENSOR);
    assert!(h.transport.is_connected(&PeripheralId::new(SENSOR)));

    frames.send_bpm(96);
    let mut latest = Value::Null;
    for _ in 0..50 {
        let telemetry: Value = h.server.get("/api/telemetry").await.json();
        latest = telemetry["latest_reading"].clone();
        if !latest.is_null() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(latest["bpm"], 96);

    let again = h.server.post("/api/device/connect").await;
    again.assert_status(StatusCode::CONFLICT);

    let response = h.server.post("/api/device/disconnect").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["state"], "disconnected");
    assert_eq!(body["readings"], 1);
    assert!(!h.transport.is_connected(&PeripheralId::new(SENSOR)));

    let device: Value = h.server.get("/api/device").await.json();
    assert_eq!(device["streaming"], false);
}

#[tokio::test]
async fn missing_adapter_is_service_unavailable() {
    let h = build(None, Arc::new(MockTransport::new()));

    let device: Value = h.server.get("/api/device").await.json();
    assert_eq!(device["available"], false);

    let response = h.server.post("/api/device/connect").await;
    response.assert_status(StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = response.json();
    assert_eq!(body["error"], "bluetooth_unavailable");
}

#[tokio::test]
async fn token_is_handed_to_backend() {
    let h = harness();

    let response = h
        .server
        .put("/api/backend/token")
        .json(&json!({"token": "abc123"}))
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["authenticated"], true);
    assert_eq!(h.backend.token().as_deref(), Some("abc123"));

    let response = h
        .server
        .put("/api/backend/token")
        .json(&json!({"token": "  "}))
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);

    h.server
        .put("/api/backend/token")
        .json(&json!({"token": null}))
        .await
        .assert_status_ok();
    assert_eq!(h.backend.token(), None);
}

#[tokio::test]
async fn openapi_document_is_served() {
    let h = harness();

    let response = h.server.get("/api/openapi.json").await;
    response.assert_status_ok();
    let doc: Value = response.json();
    assert_eq!(doc["info"]["title"], "HikeSense API");
    assert!(doc["paths"]["/api/session/sos"].is_object());

    assert_ok!(hikesense_server::api::get_openapi_json());
}

async fn telemetry_until(h: &Harness, done: impl Fn(&Value) -> bool) -> Value {
    for _ in 0..100 {
        let telemetry: Value = h.server.get("/api/telemetry").await.json();
        if done(&telemetry) {
            return telemetry;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("telemetry never reached the expected state");
}

async fn until(done: impl Fn() -> bool) {
    for _ in 0..200 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

fn window_len(telemetry: &Value) -> usize {
    telemetry["alerts"]["window"].as_array().map_or(0, Vec::len)
}

#[tokio::test]
async fn sensor_can_be_reconnected_after_disconnect() {
    let h = harness();
    let frames = h.transport.frame_sender();

    h.server.post("/api/device/connect").await.assert_status_ok();
    h.server.post("/api/device/disconnect").await.assert_status_ok();

    let response = h.server.post("/api/device/connect").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["state"], "streaming");

    frames.send_bpm(101);
    let telemetry = telemetry_until(&h, |t| t["latest_reading"]["bpm"] == 101).await;
    assert_eq!(window_len(&telemetry), 1);

    let body: Value = h.server.post("/api/device/disconnect").await.json();
    assert_eq!(body["readings"], 1);
}

#[tokio::test]
async fn refused_notifications_fail_connect_and_release_sensor() {
    let h = harness();
    let id = PeripheralId::new(SENSOR);

    h.transport.refuse_monitor(true);
    let response = h.server.post("/api/device/connect").await;
    response.assert_status(StatusCode::BAD_GATEWAY);
    let body: Value = response.json();
    assert_eq!(body["error"], "subscription_failed");
    assert!(!h.transport.is_connected(&id));

    let device: Value = h.server.get("/api/device").await.json();
    assert_eq!(device["state"], "disconnected");
    assert_eq!(device["streaming"], false);

    h.transport.refuse_monitor(false);
    h.server.post("/api/device/connect").await.assert_status_ok();
    assert!(h.transport.is_connected(&id));
}

#[tokio::test]
async fn disconnect_cancels_a_scan_in_flight() {
    let transport = Arc::new(
        MockTransport::new().with_peripheral(MockPeripheral::new("11:22:33:44:55:66", Some("Watch"))),
    );
    let h = build(
        Some(Arc::clone(&transport) as Arc<dyn BleTransport>),
        Arc::clone(&transport),
    );

    let connect = async { h.server.post("/api/device/connect").await };
    let disconnect = async {
        until(|| h.transport.is_scanning()).await;
        h.server.post("/api/device/disconnect").await
    };
    let (connected, disconnected) = tokio::time::timeout(
        Duration::from_secs(5),
        async { tokio::join!(connect, disconnect) },
    )
    .await
    .expect("disconnect did not interrupt the scan");

    connected.assert_status(StatusCode::CONFLICT);
    let body: Value = connected.json();
    assert_eq!(body["error"], "discovery_cancelled");
    disconnected.assert_status_ok();
    assert!(!h.transport.is_scanning());
}

#[tokio::test]
async fn unanswered_sos_does_not_block_the_session() {
    let h = harness();
    h.server.post("/api/session/select").json(&ridge_loop()).await;
    h.server.post("/api/session/start").await.assert_status_ok();
    h.backend.stall(true);

    let sos = async { h.server.post("/api/session/sos").await };
    let meanwhile = async {
        until(|| h.backend.sos_calls().len() == 1).await;
        let snapshot = tokio::time::timeout(Duration::from_secs(1), async {
            h.server.get("/api/session").await
        })
        .await
        .expect("session stayed locked while SOS was in flight");
        let paused = h.server.post("/api/session/pause").await;
        (snapshot, paused)
    };

    let (snapshot, paused) = tokio::select! {
        _ = sos => panic!("SOS answered by a backend that never replies"),
        checks = meanwhile => checks,
    };
    let snapshot: Value = snapshot.json();
    assert_eq!(snapshot["state"], "in_progress");
    paused.assert_status_ok();
}

#[tokio::test]
async fn unanswered_submission_is_handed_out_once() {
    let h = harness();
    h.server.post("/api/session/select").json(&ridge_loop()).await;
    h.server.post("/api/session/start").await;
    h.server.post("/api/session/finish").await.assert_status_ok();
    h.backend.stall(true);

    let first = async {
        h.server
            .post("/api/session/favourite")
            .json(&json!({"is_favourite": true}))
            .await
    };
    let second = async {
        until(|| h.backend.sessions().len() == 1).await;
        let snapshot: Value = h.server.get("/api/session").await.json();
        let again = h
            .server
            .post("/api/session/favourite")
            .json(&json!({"is_favourite": false}))
            .await;
        (snapshot, again)
    };

    let (snapshot, again) = tokio::select! {
        _ = first => panic!("submission answered by a backend that never replies"),
        checks = second => checks,
    };
    assert_eq!(snapshot["state"], "completed");
    again.assert_status(StatusCode::CONFLICT);
    assert_eq!(h.backend.sessions().len(), 1);
}

#[tokio::test]
async fn readings_before_start_do_not_count_towards_an_alert() {
    let h = harness();
    let frames = h.transport.frame_sender();
    h.server.post("/api/session/select").json(&ridge_loop()).await;
    h.server.post("/api/device/connect").await.assert_status_ok();

    for _ in 0..3 {
        frames.send_bpm(210);
    }
    telemetry_until(&h, |t| window_len(t) == 3).await;

    h.server.post("/api/session/start").await.assert_status_ok();
    let telemetry: Value = h.server.get("/api/telemetry").await.json();
    assert_eq!(window_len(&telemetry), 0);

    for _ in 0..2 {
        frames.send_bpm(210);
    }
    let telemetry = telemetry_until(&h, |t| window_len(t) == 2).await;
    assert_eq!(telemetry["alerts"]["dispatched"], 0);
    assert!(h.backend.alerts().is_empty());

    h.server.post("/api/device/disconnect").await.assert_status_ok();
}
