//! Orchestrator (C11, §4.11): sole owner of every subsystem; the only
//! public lifecycle surface embedders drive. Resolves the cyclic
//! tracker/motion/geofence/delivery references per §9 by owning the
//! concrete components directly and routing their event channels itself,
//! rather than handing each component a listener back into the others.

use crate::clock::Clock;
use crate::config::{ConfigChangeSet, ConfigPatch, ConfigStore};
use crate::delivery::DeliveryEngine;
use crate::dispatcher::{Event, EventDispatcher, HeadlessDispatcher, HeadlessHandles};
use crate::error::Result;
use crate::geofence::{GeofenceEvent, GeofenceTracker};
use crate::model::{Activity, Coords, Geofence, PolygonGeofence};
use crate::motion::{MotionConfig, MotionEvent, MotionStateMachine};
use crate::scheduler::Scheduler;
use crate::store::{PersistedGeofence, PersistentStore};
use crate::system_monitor::SystemMonitor;
use crate::tracker::LocationTracker;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

/// Default interval for the scheduler's periodic re-evaluation tick (§4.6).
const SCHEDULE_TICK_SECS: u64 = 60;

/// Host-implemented location/activity source. The CORE never talks to the
/// OS location APIs itself; it only asks for permission state and pushes
/// the distance filter that should gate the next fix.
pub trait LocationProducer: Send + Sync {
    fn has_permission(&self) -> bool;
    fn start(&self, min_distance_meters: f64) -> Result<()>;
    fn stop(&self) -> Result<()>;
    fn update_min_distance(&self, min_distance_meters: f64) -> Result<()>;
}

/// A producer that always grants permission and otherwise does nothing.
/// Suitable for tests and headless embeddings with no real OS producer.
#[derive(Debug, Default)]
pub struct NullLocationProducer;

impl LocationProducer for NullLocationProducer {
    fn has_permission(&self) -> bool {
        true
    }
    fn start(&self, _min_distance_meters: f64) -> Result<()> {
        Ok(())
    }
    fn stop(&self) -> Result<()> {
        Ok(())
    }
    fn update_min_distance(&self, _min_distance_meters: f64) -> Result<()> {
        Ok(())
    }
}

/// Snapshot of the orchestrator's externally visible lifecycle state,
/// returned by every lifecycle operation (§4.11).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrchestratorState {
    pub enabled: bool,
    pub is_moving: bool,
    pub odometer: f64,
}

/// C11: wires C1-C10 together and exposes the lifecycle/control API.
pub struct Orchestrator {
    config: Arc<ConfigStore>,
    store: Arc<PersistentStore>,
    clock: Arc<dyn Clock>,
    motion: Arc<MotionStateMachine>,
    geofences: Arc<GeofenceTracker>,
    scheduler: Arc<Scheduler>,
    tracker: Arc<LocationTracker>,
    delivery: Arc<DeliveryEngine>,
    system_monitor: Arc<dyn SystemMonitor>,
    dispatcher: Arc<EventDispatcher>,
    headless: Arc<HeadlessDispatcher>,
    producer: Arc<dyn LocationProducer>,
    enabled: AtomicBool,
    heartbeat_generation: AtomicU64,
    schedule_generation: AtomicU64,
    event_consumers_started: AtomicBool,
    motion_rx: Mutex<Option<UnboundedReceiver<MotionEvent>>>,
    geofence_rx: Mutex<Option<UnboundedReceiver<GeofenceEvent>>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: Arc<ConfigStore>,
        store: Arc<PersistentStore>,
        clock: Arc<dyn Clock>,
        motion: Arc<MotionStateMachine>,
        motion_rx: UnboundedReceiver<MotionEvent>,
        geofences: Arc<GeofenceTracker>,
        geofence_rx: UnboundedReceiver<GeofenceEvent>,
        scheduler: Arc<Scheduler>,
        tracker: Arc<LocationTracker>,
        delivery: Arc<DeliveryEngine>,
        system_monitor: Arc<dyn SystemMonitor>,
        dispatcher: Arc<EventDispatcher>,
        headless: Arc<HeadlessDispatcher>,
        producer: Arc<dyn LocationProducer>,
    ) -> Arc<Self> {
        let this = Arc::new(Self {
            config,
            store,
            clock,
            motion,
            geofences,
            scheduler,
            tracker,
            delivery,
            system_monitor,
            dispatcher,
            headless,
            producer,
            enabled: AtomicBool::new(false),
            heartbeat_generation: AtomicU64::new(0),
            schedule_generation: AtomicU64::new(0),
            event_consumers_started: AtomicBool::new(false),
            motion_rx: Mutex::new(Some(motion_rx)),
            geofence_rx: Mutex::new(Some(geofence_rx)),
        });
        this.spawn_event_consumers();
        this.spawn_schedule_tick();
        this
    }

    fn spawn_event_consumers(self: &Arc<Self>) {
        if self.event_consumers_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let motion_rx = self.motion_rx.lock().take();
        if let Some(mut rx) = motion_rx {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    match event {
                        MotionEvent::MotionChange(is_moving) => {
                            let _ = this.tracker.on_motion_change(is_moving).await;
                            let config = this.config.snapshot();
                            let min_distance = LocationTracker::producer_min_distance(
                                is_moving,
                                config.distance_filter,
                                config.stationary_radius,
                            );
                            let _ = this.producer.update_min_distance(min_distance);
                        }
                        MotionEvent::ActivityChange(activity) => {
                            let _ = this.tracker.on_activity_change(activity).await;
                        }
                    }
                }
            });
        }

        let geofence_rx = self.geofence_rx.lock().take();
        if let Some(mut rx) = geofence_rx {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    let _ = this
                        .tracker
                        .on_geofence(&event.identifier, event.action.as_str())
                        .await;
                }
            });
        }
    }

    fn state(&self) -> OrchestratorState {
        OrchestratorState {
            enabled: self.enabled.load(Ordering::SeqCst),
            is_moving: self.motion.is_moving(),
            odometer: self.tracker.odometer(),
        }
    }

    fn motion_config(&self) -> MotionConfig {
        let config = self.config.snapshot();
        MotionConfig {
            min_activity_confidence: config.min_activity_confidence,
            motion_trigger_delay_ms: config.motion_trigger_delay_ms,
            stop_detection_delay_ms: config.stop_detection_delay_ms,
            stop_timeout_minutes: config.stop_timeout_minutes,
            disable_stop_detection: config.disable_stop_detection,
        }
    }

    fn rehydrate_geofences(&self) -> Result<()> {
        let max = self.config.snapshot().max_monitored_geofences;
        self.geofences.set_max_monitored(max as i64);
        for persisted in self.store.list_geofences()? {
            match persisted {
                PersistedGeofence::Circular(g) => self.geofences.register_circular(g),
                PersistedGeofence::Polygon(p) => self.geofences.register_polygon(p),
            }
        }
        self.emit_geofences_change();
        Ok(())
    }

    fn emit_geofences_change(&self) {
        self.dispatcher.send_event(Event::new(
            "geofenceschange",
            json!({ "identifiers": self.geofences.identifiers() }),
        ));
    }

    fn spawn_heartbeat(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let my_gen = self.heartbeat_generation.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::spawn(async move {
            loop {
                let interval_secs = this.config.snapshot().heartbeat_interval_seconds;
                if interval_secs <= 0 {
                    return;
                }
                tokio::time::sleep(Duration::from_secs(interval_secs as u64)).await;
                if this.heartbeat_generation.load(Ordering::SeqCst) != my_gen
                    || !this.enabled.load(Ordering::SeqCst)
                {
                    return;
                }
                let _ = this.tracker.on_heartbeat().await;
            }
        });
    }

    /// §4.6: every `SCHEDULE_TICK_SECS` while `scheduleEnabled=true`, re-run
    /// `applyScheduleState` and start/stop tracking to match the computed
    /// window state. Runs for the lifetime of the Orchestrator, independent
    /// of whether tracking is currently enabled, since its job is precisely
    /// to flip that state.
    fn spawn_schedule_tick(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let my_gen = self.schedule_generation.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(SCHEDULE_TICK_SECS)).await;
                if this.schedule_generation.load(Ordering::SeqCst) != my_gen {
                    return;
                }
                if !this.scheduler.enabled() {
                    continue;
                }
                let minute_of_day = crate::scheduler::minute_of_day_from_epoch_ms(this.clock.now_ms());
                let that = Arc::clone(&this);
                this.scheduler
                    .apply_schedule_state(minute_of_day, move |should_enable| {
                        let that = Arc::clone(&that);
                        async move {
                            let currently_enabled = that.enabled.load(Ordering::SeqCst);
                            if should_enable && !currently_enabled {
                                that.start().await.is_ok()
                            } else if !should_enable && currently_enabled {
                                that.stop().await.is_ok()
                            } else {
                                true
                            }
                        }
                    })
                    .await;
            }
        });
    }

    /// §4.11 `ready`: load config, rehydrate odometer/geofences, register the
    /// system monitor, leave tracking disabled.
    pub fn ready(self: &Arc<Self>, patch: ConfigPatch) -> Result<OrchestratorState> {
        self.apply_config(patch)?;
        self.rehydrate_geofences()?;
        Ok(self.state())
    }

    /// §4.11 `start`: checks producer permission, activates tracking.
    pub async fn start(self: &Arc<Self>) -> Result<OrchestratorState> {
        if self.enabled.load(Ordering::SeqCst) {
            return Ok(self.state());
        }
        if !self.producer.has_permission() {
            log::error!("start refused: location permission not granted");
            return Ok(self.state());
        }

        self.rehydrate_geofences()?;
        let config = self.config.snapshot();
        let min_distance = LocationTracker::producer_min_distance(
            self.motion.is_moving(),
            config.distance_filter,
            config.stationary_radius,
        );
        self.producer.start(min_distance)?;

        self.enabled.store(true, Ordering::SeqCst);
        self.spawn_heartbeat();
        self.on_provider_change();
        self.dispatcher
            .send_event(Event::new("enabledchange", json!(true)));
        Ok(self.state())
    }

    /// §4.11 `stop`: inverse of `start`.
    pub async fn stop(self: &Arc<Self>) -> Result<OrchestratorState> {
        if !self.enabled.swap(false, Ordering::SeqCst) {
            return Ok(self.state());
        }
        self.heartbeat_generation.fetch_add(1, Ordering::SeqCst);
        self.producer.stop()?;
        self.dispatcher
            .send_event(Event::new("enabledchange", json!(false)));
        Ok(self.state())
    }

    /// Called by the host whenever the OS reports a connectivity/provider
    /// change; the CORE has no way to observe this on its own (§9).
    pub fn on_provider_change(&self) {
        self.dispatcher.send_event(Event::new(
            "providerchange",
            json!({
                "connected": self.system_monitor.is_connected(),
                "powerSaveMode": self.system_monitor.power_save_mode(),
            }),
        ));
    }

    /// §4.11 `applyConfig`: superset of `ConfigStore::apply` that re-arms
    /// subsystems whose armed state depends on the changed fields.
    pub fn apply_config(self: &Arc<Self>, patch: ConfigPatch) -> Result<ConfigChangeSet> {
        let heartbeat_changed = patch.heartbeat_interval_seconds.is_some();
        let geofence_cap_changed = patch.max_monitored_geofences.is_some();
        let schedule_changed = patch.schedule.is_some() || patch.schedule_enabled.is_some();

        let changes = self.config.apply(patch)?;

        if heartbeat_changed && self.enabled.load(Ordering::SeqCst) {
            self.spawn_heartbeat();
        }
        if geofence_cap_changed {
            let max = self.config.snapshot().max_monitored_geofences;
            self.geofences.set_max_monitored(max as i64);
            self.emit_geofences_change();
        }
        if schedule_changed {
            let config = self.config.snapshot();
            self.scheduler.set_enabled(config.schedule_enabled);
        }
        Ok(changes)
    }

    /// §4.11 `changePace`: explicit override, bypassing the debounce timers.
    pub fn change_pace(&self, is_moving: bool) -> Result<()> {
        self.motion.force_moving(is_moving);
        let config = self.config.snapshot();
        let min_distance = LocationTracker::producer_min_distance(
            is_moving,
            config.distance_filter,
            config.stationary_radius,
        );
        self.producer.update_min_distance(min_distance)
    }

    /// §4.11 `syncNow`: drive whichever path the current config prefers,
    /// then drain anything already queued.
    pub async fn sync_now(&self) -> Result<()> {
        let config = self.config.snapshot();
        if config.batch_sync {
            self.delivery.attempt_batch_sync().await?;
        } else {
            self.delivery.sync_now(None).await?;
        }
        self.delivery.sync_queue(None).await
    }

    pub fn register_headless(&self, handles: HeadlessHandles) {
        self.headless.register(handles);
        self.headless
            .set_enabled(self.config.snapshot().enable_headless);
    }

    pub fn add_geofence(&self, geofence: Geofence) -> Result<()> {
        self.store
            .save_geofence(&PersistedGeofence::Circular(geofence.clone()))?;
        self.geofences.register_circular(geofence);
        self.emit_geofences_change();
        Ok(())
    }

    pub fn add_polygon_geofence(&self, geofence: PolygonGeofence) -> Result<()> {
        self.store
            .save_geofence(&PersistedGeofence::Polygon(geofence.clone()))?;
        self.geofences.register_polygon(geofence);
        self.emit_geofences_change();
        Ok(())
    }

    pub fn remove_geofence(&self, identifier: &str) -> Result<()> {
        self.store.delete_geofence(identifier)?;
        self.geofences.remove(identifier);
        self.emit_geofences_change();
        Ok(())
    }

    /// §4.11 `setSchedule`: toggle the scheduler without touching
    /// `scheduleEnabled` in config (useful for a host-driven override). On
    /// the enable transition, emits `schedule` via `LocationTracker` per
    /// §4.7 ("emit a `schedule` event with `lastLocation` at enable points").
    pub async fn set_schedule(&self, enabled: bool) -> Result<()> {
        let was_enabled = self.scheduler.enabled();
        self.scheduler.set_enabled(enabled);
        if enabled && !was_enabled {
            self.tracker.on_schedule_enabled().await?;
        }
        Ok(())
    }

    /// §4.11 `release`: cancels timers and marks DeliveryEngine released.
    /// In-flight requests are left to complete and observe the flag
    /// themselves rather than being force-terminated (§5).
    pub async fn release(self: &Arc<Self>) -> Result<()> {
        self.stop().await?;
        self.schedule_generation.fetch_add(1, Ordering::SeqCst);
        self.delivery.release();
        Ok(())
    }

    /// Entry point the host's `LocationProducer` calls with each accepted
    /// fix: fans out to the odometer/event stream, geofence evaluation, and
    /// (if carried) activity classification.
    pub async fn on_location_fix(
        &self,
        coords: Coords,
        activity: Option<Activity>,
        is_moving: Option<bool>,
    ) -> Result<()> {
        let uuid = self.clock.new_uuid();
        let now_ms = self.clock.now_ms();
        let timestamp = chrono::DateTime::from_timestamp_millis(now_ms)
            .unwrap_or_else(chrono::Utc::now);

        self.geofences.evaluate(coords.latitude, coords.longitude, now_ms);

        let config = self.config.snapshot();
        if let Some(activity) = activity {
            if !config.disable_motion_activity_updates {
                self.motion
                    .on_activity_event(activity, &config.trigger_activities, self.motion_config());
            }
        }

        self.tracker
            .on_location(coords, activity, is_moving, uuid, timestamp)
            .await?;
        Ok(())
    }

    /// Entry point for standalone activity classifier updates arriving
    /// independently of a location fix.
    pub fn on_activity_fix(&self, activity: Activity) {
        let config = self.config.snapshot();
        if config.disable_motion_activity_updates {
            return;
        }
        self.motion
            .on_activity_event(activity, &config.trigger_activities, self.motion_config());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::config::{ConfigPatch, NullConfigPersistence};
    use crate::delivery::{DeliveryEngine, HttpTransport, OutboundRequest, TransportResponse};
    use crate::model::ActivityType;
    use async_trait::async_trait;

    struct NoopTransport;

    #[async_trait]
    impl HttpTransport for NoopTransport {
        async fn send(&self, _request: OutboundRequest) -> Result<TransportResponse> {
            Ok(TransportResponse {
                status: 200,
                body_text: String::new(),
            })
        }
    }

    fn build() -> Arc<Orchestrator> {
        let config = Arc::new(ConfigStore::new(Arc::new(NullConfigPersistence)).unwrap());
        let store = crate::store::in_memory_store();
        let clock: Arc<dyn Clock> = Arc::new(FakeClock::new(0));
        let headless = Arc::new(HeadlessDispatcher::new());
        let dispatcher = Arc::new(EventDispatcher::new(Arc::clone(&headless)));
        let monitor: Arc<dyn SystemMonitor> = Arc::new(crate::system_monitor::AlwaysConnectedMonitor);

        let (motion_tx, motion_rx) = tokio::sync::mpsc::unbounded_channel();
        let motion = Arc::new(MotionStateMachine::new(Arc::clone(&clock), motion_tx));
        let (geo_tx, geo_rx) = tokio::sync::mpsc::unbounded_channel();
        let geofences = Arc::new(GeofenceTracker::new(Arc::clone(&clock), geo_tx));
        let scheduler = Arc::new(Scheduler::new(&[]).unwrap());

        let transport: Arc<dyn HttpTransport> = Arc::new(NoopTransport);
        let delivery = Arc::new(DeliveryEngine::new(
            Arc::clone(&config),
            Arc::clone(&store),
            Arc::clone(&clock),
            Arc::clone(&monitor),
            Arc::clone(&dispatcher),
            transport,
        ));
        let tracker = Arc::new(
            LocationTracker::new(
                Arc::clone(&config),
                Arc::clone(&store),
                Arc::clone(&dispatcher),
                Arc::clone(&delivery),
                Arc::clone(&monitor),
            )
            .unwrap(),
        );
        let producer: Arc<dyn LocationProducer> = Arc::new(NullLocationProducer);

        Orchestrator::new(
            config, store, clock, motion, motion_rx, geofences, geo_rx, scheduler, tracker,
            delivery, monitor, dispatcher, headless, producer,
        )
    }

    #[tokio::test]
    async fn ready_then_start_enables_tracking() {
        let orchestrator = build();
        let state = orchestrator.ready(ConfigPatch::default()).unwrap();
        assert!(!state.enabled);

        let state = orchestrator.start().await.unwrap();
        assert!(state.enabled);
    }

    #[tokio::test]
    async fn stop_is_idempotent_when_not_started() {
        let orchestrator = build();
        let state = orchestrator.stop().await.unwrap();
        assert!(!state.enabled);
    }

    #[tokio::test]
    async fn change_pace_updates_motion_state_immediately() {
        let orchestrator = build();
        orchestrator.change_pace(true).unwrap();
        assert!(orchestrator.motion.is_moving());
    }

    #[tokio::test]
    async fn on_location_fix_updates_odometer_and_geofences() {
        let orchestrator = build();
        orchestrator
            .add_geofence(Geofence::new("home", 0.0, 0.0, 100.0).unwrap())
            .unwrap();

        orchestrator
            .on_location_fix(
                Coords::new(0.0, 0.0, 5.0).unwrap(),
                Some(Activity::new(ActivityType::Walking, 90).unwrap()),
                Some(false),
            )
            .await
            .unwrap();

        assert_eq!(orchestrator.tracker.odometer(), 0.0);
        assert!(orchestrator.tracker.last_location().is_some());
    }
}
