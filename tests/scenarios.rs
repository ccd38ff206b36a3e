//! End-to-end scenarios driven entirely through the public `Orchestrator`
//! API: a fake `HttpTransport` plus a `FakeClock` stand in for the network
//! and wall clock, and (where persisted state needs inspecting from outside
//! the crate) a second `aof_store` handle re-opened against the same file.

use async_trait::async_trait;
use geotrack_core::clock::FakeClock;
use geotrack_core::{
    Activity, ActivityType, Clock, ConfigPatch, Coords, Geofence, HttpTransport,
    OrchestratorBuilder, OutboundRequest, PersistMode, TransportResponse,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct RecordingTransport {
    responses: Mutex<VecDeque<TransportResponse>>,
    calls: AtomicUsize,
    bodies: Mutex<Vec<Value>>,
}

impl RecordingTransport {
    fn new(responses: Vec<TransportResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            calls: AtomicUsize::new(0),
            bodies: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn bodies(&self) -> Vec<Value> {
        self.bodies.lock().clone()
    }
}

#[async_trait]
impl HttpTransport for RecordingTransport {
    async fn send(&self, request: OutboundRequest) -> geotrack_core::Result<TransportResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.bodies.lock().push(request.body);
        Ok(self.responses.lock().pop_front().unwrap_or(TransportResponse {
            status: 200,
            body_text: String::new(),
        }))
    }
}

fn walking(confidence: u8) -> Activity {
    Activity::new(ActivityType::Walking, confidence).unwrap()
}

#[tokio::test]
async fn scenario_1_single_path_posts_one_location() {
    let transport = Arc::new(RecordingTransport::new(vec![TransportResponse {
        status: 200,
        body_text: "ok".into(),
    }]));
    let clock = Arc::new(FakeClock::new(0));
    let orchestrator = OrchestratorBuilder::new()
        .in_memory()
        .clock(clock as Arc<dyn Clock>)
        .transport(Arc::clone(&transport) as Arc<dyn HttpTransport>)
        .build()
        .unwrap();

    orchestrator
        .ready(ConfigPatch {
            url: Some("https://example.invalid/locations".into()),
            auto_sync: Some(true),
            batch_sync: Some(false),
            ..Default::default()
        })
        .unwrap();

    orchestrator
        .on_location_fix(Coords::new(37.4, -122.1, 5.0).unwrap(), None, Some(true))
        .await
        .unwrap();

    assert_eq!(transport.calls(), 1);
    assert!(transport.bodies()[0].get("location").is_some());
}

#[tokio::test]
async fn scenario_2_batch_threshold_through_orchestrator() {
    let transport = Arc::new(RecordingTransport::new(vec![TransportResponse {
        status: 200,
        body_text: "ok".into(),
    }]));
    let clock = Arc::new(FakeClock::new(0));
    let orchestrator = OrchestratorBuilder::new()
        .in_memory()
        .clock(clock as Arc<dyn Clock>)
        .transport(Arc::clone(&transport) as Arc<dyn HttpTransport>)
        .build()
        .unwrap();

    orchestrator
        .ready(ConfigPatch {
            url: Some("https://example.invalid/locations".into()),
            auto_sync: Some(true),
            batch_sync: Some(true),
            max_batch_size: Some(5),
            auto_sync_threshold: Some(3),
            ..Default::default()
        })
        .unwrap();

    orchestrator
        .on_location_fix(Coords::new(0.0, 0.0, 5.0).unwrap(), None, Some(true))
        .await
        .unwrap();
    orchestrator
        .on_location_fix(Coords::new(0.0, 0.001, 5.0).unwrap(), None, Some(true))
        .await
        .unwrap();
    assert_eq!(transport.calls(), 0, "below auto_sync_threshold");

    orchestrator
        .on_location_fix(Coords::new(0.0, 0.002, 5.0).unwrap(), None, Some(true))
        .await
        .unwrap();
    assert_eq!(transport.calls(), 1, "threshold met, batch sent");
    let locations = transport.bodies()[0].get("locations").unwrap().as_array().unwrap().clone();
    assert_eq!(locations.len(), 3);
}

#[cfg(feature = "aof")]
#[tokio::test]
async fn scenario_3_retry_then_dead_letter_through_orchestrator() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scenario3.aof");

    {
        let seed = geotrack_core::aof_store(&path).unwrap();
        seed.enqueue(serde_json::json!({}), None, "k1".into(), "id-1".into(), 0, 7, 100)
            .unwrap();
    }

    let transport = Arc::new(RecordingTransport::new(vec![
        TransportResponse { status: 500, body_text: "".into() },
        TransportResponse { status: 500, body_text: "".into() },
        TransportResponse { status: 500, body_text: "".into() },
    ]));
    let clock = Arc::new(FakeClock::new(0));
    let orchestrator = OrchestratorBuilder::new()
        .aof_path(&path)
        .clock(Arc::clone(&clock) as Arc<dyn Clock>)
        .transport(Arc::clone(&transport) as Arc<dyn HttpTransport>)
        .build()
        .unwrap();

    orchestrator
        .ready(ConfigPatch {
            url: Some("https://example.invalid/queue".into()),
            auto_sync: Some(false), // keep the single/batch paths quiet; only sync_queue should spend transport calls
            max_retry: Some(2),
            retry_delay_ms: Some(1_000),
            retry_delay_multiplier: Some(2.0),
            max_retry_delay_ms: Some(10_000),
            ..Default::default()
        })
        .unwrap();

    orchestrator.sync_now().await.unwrap();
    clock.advance(1_000);
    orchestrator.sync_now().await.unwrap();
    clock.advance(2_000);
    orchestrator.sync_now().await.unwrap();

    assert_eq!(transport.calls(), 3);

    let reopened = geotrack_core::aof_store(&path).unwrap();
    assert!(reopened.read_queue(None).unwrap().is_empty());
    let dead = reopened.read_dead_letters().unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].item.id, "id-1");
}

#[tokio::test(start_paused = true)]
async fn scenario_4_motion_debounce_through_orchestrator() {
    let clock = Arc::new(FakeClock::new(0));
    let transport = Arc::new(RecordingTransport::new(vec![]));
    let orchestrator = OrchestratorBuilder::new()
        .in_memory()
        .clock(clock as Arc<dyn Clock>)
        .transport(transport as Arc<dyn HttpTransport>)
        .build()
        .unwrap();

    orchestrator
        .ready(ConfigPatch {
            motion_trigger_delay_ms: Some(15_000),
            ..Default::default()
        })
        .unwrap();

    // stop() is a no-op peek at current state as long as start() was never
    // called: enabled stays false, so it always takes the idempotent branch.
    orchestrator.on_activity_fix(walking(90));
    assert!(!orchestrator.stop().await.unwrap().is_moving);

    tokio::time::advance(Duration::from_secs(10)).await;
    orchestrator.on_activity_fix(walking(90));
    assert!(!orchestrator.stop().await.unwrap().is_moving, "still pending at t=10s");

    tokio::time::advance(Duration::from_secs(6)).await;
    assert!(orchestrator.stop().await.unwrap().is_moving, "committed by t=15s+");

    orchestrator.on_activity_fix(Activity::new(ActivityType::Still, 90).unwrap());
    assert!(orchestrator.stop().await.unwrap().is_moving, "stop timer armed, not committed yet");

    tokio::time::advance(Duration::from_secs(165)).await;
    orchestrator.on_activity_fix(walking(90));
    assert!(orchestrator.stop().await.unwrap().is_moving, "moving candidate cancels the stop timer");

    tokio::time::advance(Duration::from_secs(400)).await;
    assert!(orchestrator.stop().await.unwrap().is_moving, "cancelled stop timer never fired");
}

#[cfg(feature = "aof")]
#[tokio::test]
async fn scenario_5_geofence_enter_exit_enter_through_orchestrator() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scenario5.aof");
    let clock = Arc::new(FakeClock::new(0));
    let transport = Arc::new(RecordingTransport::new(vec![]));

    let orchestrator = OrchestratorBuilder::new()
        .aof_path(&path)
        .clock(Arc::clone(&clock) as Arc<dyn Clock>)
        .transport(transport as Arc<dyn HttpTransport>)
        .build()
        .unwrap();

    orchestrator
        .ready(ConfigPatch {
            persist_mode: Some(PersistMode::All),
            auto_sync: Some(false),
            ..Default::default()
        })
        .unwrap();

    orchestrator
        .add_geofence(Geofence::new("home", 0.0, 0.0, 100.0).unwrap())
        .unwrap();

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    orchestrator
        .on_location_fix(Coords::new(0.0, 0.0, 5.0).unwrap(), None, Some(true))
        .await
        .unwrap();
    settle().await;

    clock.advance(1_000);
    orchestrator
        .on_location_fix(Coords::new(0.0, 0.002, 5.0).unwrap(), None, Some(true))
        .await
        .unwrap();
    settle().await;

    clock.advance(1_000);
    orchestrator
        .on_location_fix(Coords::new(0.0, 0.0, 5.0).unwrap(), None, Some(true))
        .await
        .unwrap();
    settle().await;

    let reopened = geotrack_core::aof_store(&path).unwrap();
    let mut geofence_rows = reopened
        .read_locations(None)
        .unwrap()
        .into_iter()
        .filter(|l| l.event == geotrack_core::EventName::Geofence)
        .collect::<Vec<_>>();
    geofence_rows.sort_by_key(|l| l.timestamp);

    let actions: Vec<String> = geofence_rows
        .iter()
        .map(|l| l.extras.as_ref().unwrap()["action"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(actions, vec!["ENTER", "EXIT", "ENTER"]);
}
