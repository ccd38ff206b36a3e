//! Background geolocation tracking core: motion-aware fix collection,
//! geofencing, scheduling, and resilient HTTP delivery, independent of any
//! platform's location APIs.
//!
//! ```no_run
//! use geotrack_core::prelude::*;
//!
//! # async fn run() -> geotrack_core::Result<()> {
//! let orchestrator = OrchestratorBuilder::new().in_memory().build()?;
//! orchestrator.ready(ConfigPatch::default())?;
//! orchestrator.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod clock;
pub mod config;
pub mod delivery;
pub mod dispatcher;
pub mod error;
pub mod geofence;
pub mod model;
mod namespace;
pub mod motion;
pub mod orchestrator;
pub mod scheduler;
pub mod spatial;
pub mod store;
pub mod storage;
pub mod system_monitor;
pub mod tracker;

pub use builder::OrchestratorBuilder;
pub use error::{CoreError, Result};
pub use orchestrator::{LocationProducer, NullLocationProducer, Orchestrator, OrchestratorState};

pub use config::{Config, ConfigChangeSet, ConfigPatch, ConfigPersistence, ConfigStore, PersistMode};

pub use model::{
    Activity, ActivityType, Coords, DeadLetter, EventName, Geofence, Location, LogEntry,
    LogLevel, PolygonGeofence, QueueItem, TripState,
};

pub use dispatcher::{Event, EventDispatcher, HeadlessDispatcher, HeadlessHandles};

pub use clock::{Clock, SystemClock};

pub use geofence::{GeofenceAction, GeofenceEvent, GeofenceTracker};

pub use motion::{MotionConfig, MotionEvent, MotionStateMachine};

pub use scheduler::Scheduler;

pub use store::{in_memory_store, PersistedGeofence, PersistentStore};

#[cfg(feature = "aof")]
pub use store::aof_store;

pub use system_monitor::{AlwaysConnectedMonitor, NetworkType, SystemMonitor};

pub use delivery::{DeliveryEngine, HttpTransport, OutboundRequest, SyncPolicy, TransportResponse};

#[cfg(feature = "http")]
pub use delivery::ReqwestTransport;

pub use tracker::LocationTracker;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Common imports for embedders.
pub mod prelude {
    pub use crate::{CoreError, OrchestratorBuilder, Result};

    pub use crate::orchestrator::{LocationProducer, NullLocationProducer, Orchestrator, OrchestratorState};

    pub use crate::{Config, ConfigChangeSet, ConfigPatch, ConfigStore};

    pub use crate::{Activity, ActivityType, Coords, EventName, Geofence, Location, PolygonGeofence};

    pub use crate::{Event, HeadlessHandles};

    pub use crate::{Clock, SystemClock};

    pub use std::sync::Arc;
}
