//! LocationTracker (C7, §4.7): fuses location/motion/activity/schedule
//! signals into the canonical typed event stream, applies the persistence
//! policy, and drives delivery path selection.

use crate::config::{should_persist, ConfigStore};
use crate::delivery::DeliveryEngine;
use crate::dispatcher::{Event, EventDispatcher};
use crate::error::Result;
use crate::model::{Activity, Coords, EventName, Location};
use crate::spatial::distance_meters;
use crate::store::PersistentStore;
use crate::system_monitor::SystemMonitor;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;

/// C7: owns `lastLocation`/odometer and turns raw signals into events.
pub struct LocationTracker {
    config: Arc<ConfigStore>,
    store: Arc<PersistentStore>,
    dispatcher: Arc<EventDispatcher>,
    delivery: Arc<DeliveryEngine>,
    system_monitor: Arc<dyn SystemMonitor>,
    last_location: Mutex<Option<Location>>,
    odometer: Mutex<f64>,
}

impl LocationTracker {
    pub fn new(
        config: Arc<ConfigStore>,
        store: Arc<PersistentStore>,
        dispatcher: Arc<EventDispatcher>,
        delivery: Arc<DeliveryEngine>,
        system_monitor: Arc<dyn SystemMonitor>,
    ) -> Result<Self> {
        let odometer = store.get_odometer()?;
        Ok(Self {
            config,
            store,
            dispatcher,
            delivery,
            system_monitor,
            last_location: Mutex::new(None),
            odometer: Mutex::new(odometer),
        })
    }

    pub fn last_location(&self) -> Option<Location> {
        self.last_location.lock().clone()
    }

    pub fn odometer(&self) -> f64 {
        *self.odometer.lock()
    }

    /// §4.7 step 1-3: accept a raw fix, update odometer, build and emit a
    /// `location` event.
    pub async fn on_location(
        &self,
        coords: Coords,
        activity: Option<Activity>,
        is_moving: Option<bool>,
        uuid: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    ) -> Result<Location> {
        let odometer = {
            let mut last = self.last_location.lock();
            let mut odometer = self.odometer.lock();
            if let Some(prev) = last.as_ref() {
                let delta = distance_meters(
                    prev.coords.latitude,
                    prev.coords.longitude,
                    coords.latitude,
                    coords.longitude,
                );
                *odometer += delta;
            }
            self.store.set_odometer(*odometer)?;
            let value = *odometer;
            drop(last);
            value
        };

        let location = Location {
            uuid,
            timestamp,
            coords,
            activity,
            is_moving,
            event: EventName::Location,
            odometer,
            extras: None,
        };
        *self.last_location.lock() = Some(location.clone());
        self.emit(&location).await?;
        Ok(location)
    }

    /// §4.7 onMotionChange: emit a `motionchange` event using `lastLocation`.
    pub async fn on_motion_change(&self, is_moving: bool) -> Result<()> {
        let Some(base) = self.last_location.lock().clone() else {
            return Ok(());
        };
        let event = Location {
            event: EventName::MotionChange,
            is_moving: Some(is_moving),
            ..base
        };
        self.emit(&event).await
    }

    /// §4.7 onActivityChange: emit only if `lastLocation` exists.
    pub async fn on_activity_change(&self, activity: Activity) -> Result<()> {
        let Some(base) = self.last_location.lock().clone() else {
            return Ok(());
        };
        let event = Location {
            event: EventName::ActivityChange,
            activity: Some(activity),
            ..base
        };
        self.emit(&event).await
    }

    /// Heartbeat timer tick: re-emit `lastLocation` as a `heartbeat` event.
    pub async fn on_heartbeat(&self) -> Result<()> {
        let Some(base) = self.last_location.lock().clone() else {
            return Ok(());
        };
        let event = Location {
            event: EventName::Heartbeat,
            ..base
        };
        self.emit(&event).await
    }

    /// Scheduler enable point: emit a `schedule` event for observability.
    pub async fn on_schedule_enabled(&self) -> Result<()> {
        let Some(base) = self.last_location.lock().clone() else {
            return Ok(());
        };
        let event = Location {
            event: EventName::Schedule,
            ..base
        };
        self.emit(&event).await
    }

    /// Emit a `geofence` event for a transition reported by `GeofenceTracker`.
    /// Uses `lastLocation` as the positional basis; no-op if none exists yet.
    pub async fn on_geofence(&self, identifier: &str, action: &str) -> Result<()> {
        let Some(base) = self.last_location.lock().clone() else {
            return Ok(());
        };
        let event = Location {
            event: EventName::Geofence,
            extras: Some(serde_json::json!({ "identifier": identifier, "action": action })),
            ..base
        };
        self.emit(&event).await
    }

    /// §4.7 `emit(event)`: dispatch, persist per policy, sync per config.
    async fn emit(&self, location: &Location) -> Result<()> {
        let payload = serde_json::to_value(location)?;
        self.dispatcher
            .send_event(Event::new(location.event.as_str(), payload.clone()));

        let config = self.config.snapshot();
        if should_persist(config.batch_sync, config.persist_mode, location.event) {
            self.store.insert_location(location)?;
        }

        if config.auto_sync && config.url.is_some() && self.system_monitor.is_auto_sync_allowed(&config) {
            if config.batch_sync {
                self.delivery.attempt_batch_sync().await?;
            } else {
                self.delivery.sync_now(Some(payload)).await?;
            }
        }
        Ok(())
    }

    /// Producer request parameters driven by the moving/stationary state
    /// (§4.7 onMotionChange): `minDistance = isMoving ? distanceFilter :
    /// stationaryRadius`.
    pub fn producer_min_distance(is_moving: bool, distance_filter: f64, stationary_radius: f64) -> f64 {
        if is_moving {
            distance_filter
        } else {
            stationary_radius
        }
    }

    pub fn extras_placeholder() -> Option<Value> {
        None
    }
}
