//! GeofenceTracker (C5, §4.5): ordered registry of circular/polygon regions
//! with enter/exit/dwell transition tracking.

use crate::clock::Clock;
use crate::model::{Geofence, PolygonGeofence};
use crate::spatial::{distance_meters, inside_polygon};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeofenceAction {
    Enter,
    Exit,
    Dwell,
}

impl GeofenceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            GeofenceAction::Enter => "ENTER",
            GeofenceAction::Exit => "EXIT",
            GeofenceAction::Dwell => "DWELL",
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeofenceEvent {
    pub identifier: String,
    pub action: GeofenceAction,
}

#[derive(Debug, Clone)]
enum Region {
    Circular(Geofence),
    Polygon(PolygonGeofence),
}

impl Region {
    fn identifier(&self) -> &str {
        match self {
            Region::Circular(g) => &g.identifier,
            Region::Polygon(p) => &p.identifier,
        }
    }

    fn notify_on_entry(&self) -> bool {
        match self {
            Region::Circular(g) => g.notify_on_entry,
            Region::Polygon(p) => p.notify_on_entry,
        }
    }

    fn notify_on_exit(&self) -> bool {
        match self {
            Region::Circular(g) => g.notify_on_exit,
            Region::Polygon(p) => p.notify_on_exit,
        }
    }

    fn notify_on_dwell(&self) -> bool {
        match self {
            Region::Circular(g) => g.notify_on_dwell,
            Region::Polygon(_) => false,
        }
    }

    fn loitering_delay_ms(&self) -> i64 {
        match self {
            Region::Circular(g) => g.loitering_delay_ms,
            Region::Polygon(_) => 0,
        }
    }

    fn contains(&self, lat: f64, lng: f64) -> bool {
        match self {
            Region::Circular(g) => {
                distance_meters(lat, lng, g.center_latitude, g.center_longitude) <= g.radius
            }
            Region::Polygon(p) => inside_polygon(lat, lng, &p.vertices),
        }
    }
}

struct Entry {
    region: Region,
    is_inside: bool,
    inside_since_ms: Option<i64>,
    dwelled: bool,
}

/// C5: tracks registered regions and emits enter/exit/dwell transitions.
pub struct GeofenceTracker {
    entries: Mutex<VecDeque<Entry>>,
    max_monitored: Mutex<i64>,
    clock: Arc<dyn Clock>,
    events: UnboundedSender<GeofenceEvent>,
}

impl GeofenceTracker {
    pub fn new(clock: Arc<dyn Clock>, events: UnboundedSender<GeofenceEvent>) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            max_monitored: Mutex::new(0),
            clock,
            events,
        }
    }

    pub fn set_max_monitored(&self, max: i64) {
        *self.max_monitored.lock() = max;
        self.evict_if_over_capacity();
    }

    pub fn register_circular(&self, geofence: Geofence) {
        self.remove(&geofence.identifier);
        self.entries.lock().push_back(Entry {
            region: Region::Circular(geofence),
            is_inside: false,
            inside_since_ms: None,
            dwelled: false,
        });
        self.evict_if_over_capacity();
    }

    pub fn register_polygon(&self, geofence: PolygonGeofence) {
        self.remove(&geofence.identifier);
        self.entries.lock().push_back(Entry {
            region: Region::Polygon(geofence),
            is_inside: false,
            inside_since_ms: None,
            dwelled: false,
        });
        self.evict_if_over_capacity();
    }

    pub fn remove(&self, identifier: &str) {
        self.entries
            .lock()
            .retain(|e| e.region.identifier() != identifier);
    }

    pub fn identifiers(&self) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .map(|e| e.region.identifier().to_string())
            .collect()
    }

    fn evict_if_over_capacity(&self) {
        let max = *self.max_monitored.lock();
        if max <= 0 {
            return;
        }
        let mut entries = self.entries.lock();
        while entries.len() as i64 > max {
            entries.pop_front();
        }
    }

    /// Evaluate every registered region against `(lat, lng)` at `now_ms` and
    /// emit the resulting transitions (§4.5).
    pub fn evaluate(&self, lat: f64, lng: f64, now_ms: i64) {
        let mut entries = self.entries.lock();
        for entry in entries.iter_mut() {
            let is_inside = entry.region.contains(lat, lng);

            if !entry.is_inside && is_inside {
                entry.is_inside = true;
                entry.inside_since_ms = Some(now_ms);
                entry.dwelled = false;
                if entry.region.notify_on_entry() {
                    let _ = self.events.send(GeofenceEvent {
                        identifier: entry.region.identifier().to_string(),
                        action: GeofenceAction::Enter,
                    });
                }
            } else if entry.is_inside && !is_inside {
                entry.is_inside = false;
                entry.inside_since_ms = None;
                entry.dwelled = false;
                if entry.region.notify_on_exit() {
                    let _ = self.events.send(GeofenceEvent {
                        identifier: entry.region.identifier().to_string(),
                        action: GeofenceAction::Exit,
                    });
                }
            } else if entry.is_inside && is_inside && !entry.dwelled {
                let delay = entry.region.loitering_delay_ms();
                if delay > 0 {
                    if let Some(since) = entry.inside_since_ms {
                        if now_ms - since >= delay {
                            entry.dwelled = true;
                            if entry.region.notify_on_dwell() {
                                let _ = self.events.send(GeofenceEvent {
                                    identifier: entry.region.identifier().to_string(),
                                    action: GeofenceAction::Dwell,
                                });
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    fn tracker() -> (Arc<GeofenceTracker>, tokio::sync::mpsc::UnboundedReceiver<GeofenceEvent>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (
            Arc::new(GeofenceTracker::new(Arc::new(SystemClock::new()), tx)),
            rx,
        )
    }

    #[test]
    fn enter_exit_enter_scenario_from_spec() {
        let (tracker, mut rx) = tracker();
        let mut g = Geofence::new("A", 0.0, 0.0, 100.0).unwrap();
        g.notify_on_entry = true;
        g.notify_on_exit = true;
        tracker.register_circular(g);

        tracker.evaluate(0.0, 0.0, 0);
        tracker.evaluate(0.0, 0.002, 1000);
        tracker.evaluate(0.0, 0.0, 2000);

        let events: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].action, GeofenceAction::Enter);
        assert_eq!(events[1].action, GeofenceAction::Exit);
        assert_eq!(events[2].action, GeofenceAction::Enter);
    }

    #[test]
    fn no_entry_event_when_notify_on_entry_disabled() {
        let (tracker, mut rx) = tracker();
        let mut g = Geofence::new("A", 0.0, 0.0, 100.0).unwrap();
        g.notify_on_entry = false;
        tracker.register_circular(g);

        tracker.evaluate(0.0, 0.0, 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dwell_emitted_once_after_loitering_delay() {
        let (tracker, mut rx) = tracker();
        let mut g = Geofence::new("A", 0.0, 0.0, 100.0).unwrap();
        g.notify_on_dwell = true;
        g.loitering_delay_ms = 5_000;
        tracker.register_circular(g);

        tracker.evaluate(0.0, 0.0, 0);
        rx.try_recv().unwrap(); // enter
        tracker.evaluate(0.0, 0.0, 3_000);
        assert!(rx.try_recv().is_err(), "dwell not due yet");
        tracker.evaluate(0.0, 0.0, 6_000);
        let dwell = rx.try_recv().unwrap();
        assert_eq!(dwell.action, GeofenceAction::Dwell);
        tracker.evaluate(0.0, 0.0, 9_000);
        assert!(rx.try_recv().is_err(), "dwell fires only once per window");
    }

    #[test]
    fn max_monitored_evicts_oldest_by_insertion() {
        let (tracker, _rx) = tracker();
        tracker.set_max_monitored(2);
        tracker.register_circular(Geofence::new("A", 0.0, 0.0, 10.0).unwrap());
        tracker.register_circular(Geofence::new("B", 0.0, 0.0, 10.0).unwrap());
        tracker.register_circular(Geofence::new("C", 0.0, 0.0, 10.0).unwrap());

        let ids = tracker.identifiers();
        assert_eq!(ids, vec!["B".to_string(), "C".to_string()]);
    }
}
