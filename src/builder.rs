//! Fluent builder for constructing an `Orchestrator` with custom storage,
//! clock, transport, and producer wiring.

use crate::clock::{Clock, SystemClock};
use crate::config::{Config, ConfigPatch, ConfigStore, NullConfigPersistence};
use crate::delivery::DeliveryEngine;
use crate::dispatcher::{EventDispatcher, HeadlessDispatcher};
use crate::error::Result;
use crate::geofence::GeofenceTracker;
use crate::motion::MotionStateMachine;
use crate::orchestrator::{LocationProducer, NullLocationProducer, Orchestrator};
use crate::scheduler::Scheduler;
use crate::store::PersistentStore;
use crate::system_monitor::{AlwaysConnectedMonitor, SystemMonitor};
use crate::tracker::LocationTracker;
use crate::delivery::HttpTransport;
#[cfg(feature = "http")]
use crate::delivery::ReqwestTransport;
use std::path::PathBuf;
use std::sync::Arc;

/// Builds an `Orchestrator` with either in-memory or durable storage.
pub struct OrchestratorBuilder {
    #[cfg(feature = "aof")]
    aof_path: Option<PathBuf>,
    in_memory: bool,
    initial_config: Option<Config>,
    clock: Option<Arc<dyn Clock>>,
    producer: Option<Arc<dyn LocationProducer>>,
    transport: Option<Arc<dyn HttpTransport>>,
    system_monitor: Option<Arc<dyn SystemMonitor>>,
}

impl OrchestratorBuilder {
    /// Start a new builder with in-memory storage and every dependency
    /// defaulted (system clock, null producer, always-connected monitor,
    /// real HTTP transport if the `http` feature is on).
    pub fn new() -> Self {
        Self {
            #[cfg(feature = "aof")]
            aof_path: None,
            in_memory: true,
            initial_config: None,
            clock: None,
            producer: None,
            transport: None,
            system_monitor: None,
        }
    }

    /// Persist state to an append-only file at `path`, replayed on open.
    #[cfg(feature = "aof")]
    pub fn aof_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.aof_path = Some(path.into());
        self.in_memory = false;
        self
    }

    /// Discard any durable path and use an in-memory backend.
    pub fn in_memory(mut self) -> Self {
        self.in_memory = true;
        #[cfg(feature = "aof")]
        {
            self.aof_path = None;
        }
        self
    }

    /// Seed the initial configuration (equivalent to the first `ready` call
    /// being given this patch).
    pub fn config(mut self, config: Config) -> Self {
        self.initial_config = Some(config);
        self
    }

    /// Override the clock (tests inject `FakeClock` here).
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Inject the host's location producer.
    pub fn producer(mut self, producer: Arc<dyn LocationProducer>) -> Self {
        self.producer = Some(producer);
        self
    }

    /// Override the HTTP transport (tests inject fakes here; without the
    /// `http` feature this is the only way to supply one).
    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Override the connectivity/power monitor.
    pub fn system_monitor(mut self, monitor: Arc<dyn SystemMonitor>) -> Self {
        self.system_monitor = Some(monitor);
        self
    }

    /// Build the orchestrator. Opens the persistence file if one was
    /// configured, loads any previously saved config, and wires every
    /// subsystem together.
    pub fn build(self) -> Result<Arc<Orchestrator>> {
        let store: Arc<PersistentStore> = if self.in_memory {
            crate::store::in_memory_store()
        } else {
            #[cfg(feature = "aof")]
            {
                let path = self
                    .aof_path
                    .as_ref()
                    .expect("durable build requires aof_path");
                crate::store::aof_store(path)?
            }
            #[cfg(not(feature = "aof"))]
            {
                crate::store::in_memory_store()
            }
        };

        let persistence: Arc<dyn crate::config::ConfigPersistence> = if self.in_memory {
            Arc::new(NullConfigPersistence)
        } else {
            Arc::clone(&store) as _
        };
        let config = Arc::new(match self.initial_config {
            Some(initial) => ConfigStore::with_config(persistence, initial)?,
            None => ConfigStore::new(persistence)?,
        });
        let snapshot = config.snapshot();

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock::new()));
        let producer = self
            .producer
            .unwrap_or_else(|| Arc::new(NullLocationProducer) as Arc<dyn LocationProducer>);
        let system_monitor = self
            .system_monitor
            .unwrap_or_else(|| Arc::new(AlwaysConnectedMonitor) as Arc<dyn SystemMonitor>);

        let headless = Arc::new(HeadlessDispatcher::new());
        let dispatcher = Arc::new(EventDispatcher::new(Arc::clone(&headless)));

        let transport: Arc<dyn HttpTransport> = match self.transport {
            Some(t) => t,
            #[cfg(feature = "http")]
            None => Arc::new(ReqwestTransport::new()?),
            #[cfg(not(feature = "http"))]
            None => {
                return Err(crate::error::CoreError::InvalidConfig {
                    field: "transport".into(),
                    reason: "no HttpTransport supplied and the `http` feature is disabled".into(),
                })
            }
        };

        let delivery = Arc::new(DeliveryEngine::new(
            Arc::clone(&config),
            Arc::clone(&store),
            Arc::clone(&clock),
            Arc::clone(&system_monitor),
            Arc::clone(&dispatcher),
            transport,
        ));

        let (motion_tx, motion_rx) = tokio::sync::mpsc::unbounded_channel();
        let motion = Arc::new(MotionStateMachine::new(Arc::clone(&clock), motion_tx));
        let (geo_tx, geo_rx) = tokio::sync::mpsc::unbounded_channel();
        let geofences = Arc::new(GeofenceTracker::new(Arc::clone(&clock), geo_tx));
        let scheduler = Arc::new(Scheduler::new(&snapshot.schedule)?);
        scheduler.set_enabled(snapshot.schedule_enabled);

        let tracker = Arc::new(LocationTracker::new(
            Arc::clone(&config),
            Arc::clone(&store),
            Arc::clone(&dispatcher),
            Arc::clone(&delivery),
            Arc::clone(&system_monitor),
        )?);

        Ok(Orchestrator::new(
            config,
            store,
            clock,
            motion,
            motion_rx,
            geofences,
            geo_rx,
            scheduler,
            tracker,
            delivery,
            system_monitor,
            dispatcher,
            headless,
            producer,
        ))
    }
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn default_builder_produces_a_disabled_orchestrator() {
        let orchestrator = OrchestratorBuilder::new().in_memory().build().unwrap();
        let state = orchestrator.ready(ConfigPatch::default()).unwrap();
        assert!(!state.enabled);
    }

    #[tokio::test]
    async fn seeded_config_is_applied_before_first_ready() {
        let mut config = Config::default();
        config.distance_filter = 42.0;
        let orchestrator = OrchestratorBuilder::new()
            .in_memory()
            .config(config)
            .build()
            .unwrap();
        orchestrator.ready(ConfigPatch::default()).unwrap();
        orchestrator.change_pace(true).unwrap();
    }

    #[cfg(feature = "aof")]
    #[tokio::test]
    async fn aof_path_persists_config_across_rebuilds() {
        let temp_dir = std::env::temp_dir();
        let path = temp_dir.join(format!("geotrack-builder-test-{}.aof", std::process::id()));
        let _ = std::fs::remove_file(&path);

        {
            let mut config = Config::default();
            config.distance_filter = 77.0;
            let orchestrator = OrchestratorBuilder::new()
                .aof_path(&path)
                .config(config)
                .build()
                .unwrap();
            orchestrator.ready(ConfigPatch::default()).unwrap();
        }

        let orchestrator = OrchestratorBuilder::new().aof_path(&path).build().unwrap();
        orchestrator.ready(ConfigPatch::default()).unwrap();

        let _ = std::fs::remove_file(&path);
    }
}
