//! ConfigStore (C1): typed configuration with atomic apply and durable
//! snapshotting (§4.1, §6).

use crate::error::{CoreError, Result};
use crate::model::{ActivityType, EventName, LogLevel};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// `persistMode` (§6): governs the PersistencePolicy table in §4.7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistMode {
    None,
    All,
    Geofence,
    Location,
}

/// `desiredAccuracy` (§6): a hint passed through to the location producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DesiredAccuracy {
    Navigation,
    High,
    Medium,
    Low,
    VeryLow,
    Lowest,
}

fn default_trigger_activities() -> Vec<ActivityType> {
    vec![
        ActivityType::Walking,
        ActivityType::Running,
        ActivityType::OnFoot,
        ActivityType::InVehicle,
        ActivityType::OnBicycle,
    ]
}

/// The full typed configuration snapshot (§6). Every field has a default so
/// that a completely empty patch or missing config file still yields a
/// usable engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub foreground_service: bool,
    pub notification_title: Option<String>,
    pub notification_text: Option<String>,
    pub notification_small_icon: Option<String>,
    pub notification_actions: Vec<String>,

    pub activity_recognition_interval_ms: i64,
    pub location_update_interval_ms: i64,
    pub fastest_location_update_interval_ms: i64,
    pub distance_filter: f64,
    pub stationary_radius: f64,

    pub min_activity_confidence: u8,
    pub motion_trigger_delay_ms: i64,
    pub stop_detection_delay_ms: i64,
    pub stop_timeout_minutes: i64,
    pub disable_motion_activity_updates: bool,
    pub disable_stop_detection: bool,
    pub trigger_activities: Vec<ActivityType>,

    pub url: Option<String>,
    pub method: String,
    pub http_headers: HashMap<String, String>,
    pub http_params: Value,
    pub http_extras: Value,
    pub http_timeout_ms: i64,
    pub http_root_property: Option<String>,
    pub idempotency_header: String,

    pub auto_sync: bool,
    pub batch_sync: bool,
    pub max_batch_size: usize,
    pub auto_sync_threshold: usize,
    pub disable_auto_sync_on_cellular: bool,

    pub queue_max_days: i64,
    pub queue_max_records: usize,

    pub max_retry: u32,
    pub retry_delay_ms: i64,
    pub retry_delay_multiplier: f64,
    pub max_retry_delay_ms: i64,

    pub persist_mode: PersistMode,
    pub max_days_to_persist: i64,
    pub max_records_to_persist: usize,

    pub schedule_enabled: bool,
    pub schedule: Vec<String>,

    pub heartbeat_interval_seconds: i64,

    pub enable_headless: bool,
    pub start_on_boot: bool,
    pub stop_on_terminate: bool,

    pub log_level: LogLevel,
    pub log_max_days: i64,

    pub max_monitored_geofences: usize,
    pub desired_accuracy: DesiredAccuracy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            foreground_service: false,
            notification_title: None,
            notification_text: None,
            notification_small_icon: None,
            notification_actions: Vec::new(),

            activity_recognition_interval_ms: 10_000,
            location_update_interval_ms: 1_000,
            fastest_location_update_interval_ms: 1_000,
            distance_filter: 10.0,
            stationary_radius: 25.0,

            min_activity_confidence: 75,
            motion_trigger_delay_ms: 0,
            stop_detection_delay_ms: 0,
            stop_timeout_minutes: 5,
            disable_motion_activity_updates: false,
            disable_stop_detection: false,
            trigger_activities: default_trigger_activities(),

            url: None,
            method: "POST".to_string(),
            http_headers: HashMap::new(),
            http_params: Value::Object(Default::default()),
            http_extras: Value::Object(Default::default()),
            http_timeout_ms: 60_000,
            http_root_property: None,
            idempotency_header: "Idempotency-Key".to_string(),

            auto_sync: true,
            batch_sync: false,
            max_batch_size: 50,
            auto_sync_threshold: 5,
            disable_auto_sync_on_cellular: false,

            queue_max_days: 7,
            queue_max_records: 10_000,

            max_retry: 3,
            retry_delay_ms: 1_000,
            retry_delay_multiplier: 1.5,
            max_retry_delay_ms: 30_000,

            persist_mode: PersistMode::All,
            max_days_to_persist: 7,
            max_records_to_persist: 10_000,

            schedule_enabled: false,
            schedule: Vec::new(),

            heartbeat_interval_seconds: 60,

            enable_headless: false,
            start_on_boot: false,
            stop_on_terminate: true,

            log_level: LogLevel::Info,
            log_max_days: 3,

            max_monitored_geofences: 0,
            desired_accuracy: DesiredAccuracy::High,
        }
    }
}

impl Config {
    /// Structural validation; called by `ConfigStore::apply` per field and
    /// also usable standalone (e.g. after loading from a file).
    pub fn validate_field(field: &str, value: i64) -> std::result::Result<(), String> {
        match field {
            "locationUpdateInterval" | "fastestLocationUpdateInterval" => {
                if value < 0 {
                    return Err("must be >= 0".to_string());
                }
            }
            "minActivityConfidence" => {
                if !(0..=100).contains(&value) {
                    return Err("must be in [0,100]".to_string());
                }
            }
            "maxRetry" | "maxBatchSize" | "autoSyncThreshold" | "queueMaxRecords"
            | "maxRecordsToPersist" | "maxMonitoredGeofences" => {
                if value < 0 {
                    return Err("must be >= 0".to_string());
                }
            }
            "retryDelayMs" | "maxRetryDelayMs" | "httpTimeoutMs" => {
                if value <= 0 {
                    return Err("must be > 0".to_string());
                }
            }
            _ => {}
        }
        Ok(())
    }

    pub fn from_json(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    #[cfg(feature = "toml")]
    pub fn from_toml(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| CoreError::Other(format!("invalid config toml: {e}")))
    }

    #[cfg(feature = "toml")]
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| CoreError::Other(format!("toml encode: {e}")))
    }
}

/// Partial config update: every field is optional; `None` means "leave
/// unchanged" (§4.1).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigPatch {
    pub foreground_service: Option<bool>,
    pub notification_title: Option<String>,
    pub notification_text: Option<String>,
    pub activity_recognition_interval_ms: Option<i64>,
    pub location_update_interval_ms: Option<i64>,
    pub fastest_location_update_interval_ms: Option<i64>,
    pub distance_filter: Option<f64>,
    pub stationary_radius: Option<f64>,
    pub min_activity_confidence: Option<u8>,
    pub motion_trigger_delay_ms: Option<i64>,
    pub stop_detection_delay_ms: Option<i64>,
    pub stop_timeout_minutes: Option<i64>,
    pub disable_motion_activity_updates: Option<bool>,
    pub disable_stop_detection: Option<bool>,
    pub trigger_activities: Option<Vec<ActivityType>>,
    pub url: Option<String>,
    pub method: Option<String>,
    pub http_headers: Option<HashMap<String, String>>,
    pub http_timeout_ms: Option<i64>,
    pub http_root_property: Option<String>,
    pub idempotency_header: Option<String>,
    pub auto_sync: Option<bool>,
    pub batch_sync: Option<bool>,
    pub max_batch_size: Option<usize>,
    pub auto_sync_threshold: Option<usize>,
    pub disable_auto_sync_on_cellular: Option<bool>,
    pub queue_max_days: Option<i64>,
    pub queue_max_records: Option<usize>,
    pub max_retry: Option<u32>,
    pub retry_delay_ms: Option<i64>,
    pub retry_delay_multiplier: Option<f64>,
    pub max_retry_delay_ms: Option<i64>,
    pub persist_mode: Option<PersistMode>,
    pub max_days_to_persist: Option<i64>,
    pub max_records_to_persist: Option<usize>,
    pub schedule_enabled: Option<bool>,
    pub schedule: Option<Vec<String>>,
    pub heartbeat_interval_seconds: Option<i64>,
    pub enable_headless: Option<bool>,
    pub start_on_boot: Option<bool>,
    pub stop_on_terminate: Option<bool>,
    pub log_level: Option<LogLevel>,
    pub log_max_days: Option<i64>,
    pub max_monitored_geofences: Option<usize>,
    pub desired_accuracy: Option<DesiredAccuracy>,
}

/// Field-level deltas returned by a successful `apply`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigChangeSet {
    pub changed_fields: Vec<String>,
    pub rejected_fields: Vec<(String, String)>,
}

/// Durable backing for config snapshots. `PersistentStore` implements this
/// via its single-slot mechanism; `NullConfigPersistence` is the in-memory
/// no-op used by tests and ephemeral embeddings.
pub trait ConfigPersistence: Send + Sync {
    fn save(&self, config: &Config) -> Result<()>;
    fn load(&self) -> Result<Option<Config>>;
}

/// No-op persistence: nothing is ever saved, load always returns `None`.
#[derive(Debug, Default)]
pub struct NullConfigPersistence;

impl ConfigPersistence for NullConfigPersistence {
    fn save(&self, _config: &Config) -> Result<()> {
        Ok(())
    }

    fn load(&self) -> Result<Option<Config>> {
        Ok(None)
    }
}

/// C1: holds the single current `Config` snapshot. Concurrent `apply` calls
/// are serialized through `apply_lock`; readers always observe a complete
/// snapshot via `Arc` swap, never a partially-applied patch.
pub struct ConfigStore {
    current: RwLock<Arc<Config>>,
    apply_lock: Mutex<()>,
    persistence: Arc<dyn ConfigPersistence>,
}

impl ConfigStore {
    /// Load the last persisted snapshot, or defaults if none exists.
    pub fn new(persistence: Arc<dyn ConfigPersistence>) -> Result<Self> {
        let initial = persistence.load()?.unwrap_or_default();
        Ok(Self {
            current: RwLock::new(Arc::new(initial)),
            apply_lock: Mutex::new(()),
            persistence,
        })
    }

    /// Seed the store with an explicit `config`, bypassing whatever was
    /// previously persisted (builder support: `OrchestratorBuilder::config`).
    pub fn with_config(persistence: Arc<dyn ConfigPersistence>, config: Config) -> Result<Self> {
        persistence.save(&config)?;
        Ok(Self {
            current: RwLock::new(Arc::new(config)),
            apply_lock: Mutex::new(()),
            persistence,
        })
    }

    /// An immutable snapshot of the current config.
    pub fn snapshot(&self) -> Arc<Config> {
        self.current.read().clone()
    }

    /// Merge `patch` into the current snapshot, durably persist the result,
    /// and return the set of fields that changed (and any that were
    /// rejected per-field without failing the whole patch).
    pub fn apply(&self, patch: ConfigPatch) -> Result<ConfigChangeSet> {
        let _guard = self.apply_lock.lock();
        let prior = self.current.read().clone();
        let mut next = (*prior).clone();
        let mut changes = ConfigChangeSet::default();

        macro_rules! apply_field {
            ($field:ident, $name:literal) => {
                if let Some(v) = patch.$field {
                    next.$field = v;
                    changes.changed_fields.push($name.to_string());
                }
            };
        }

        if let Some(v) = patch.location_update_interval_ms {
            match Config::validate_field("locationUpdateInterval", v) {
                Ok(()) => {
                    next.location_update_interval_ms = v;
                    changes.changed_fields.push("locationUpdateInterval".into());
                }
                Err(reason) => {
                    log::warn!("rejected locationUpdateInterval={v}: {reason}");
                    changes
                        .rejected_fields
                        .push(("locationUpdateInterval".into(), reason));
                }
            }
        }
        if let Some(v) = patch.fastest_location_update_interval_ms {
            match Config::validate_field("fastestLocationUpdateInterval", v) {
                Ok(()) => {
                    next.fastest_location_update_interval_ms = v;
                    changes
                        .changed_fields
                        .push("fastestLocationUpdateInterval".into());
                }
                Err(reason) => {
                    log::warn!("rejected fastestLocationUpdateInterval={v}: {reason}");
                    changes
                        .rejected_fields
                        .push(("fastestLocationUpdateInterval".into(), reason));
                }
            }
        }
        if let Some(v) = patch.min_activity_confidence {
            match Config::validate_field("minActivityConfidence", v as i64) {
                Ok(()) => {
                    next.min_activity_confidence = v;
                    changes.changed_fields.push("minActivityConfidence".into());
                }
                Err(reason) => {
                    log::warn!("rejected minActivityConfidence={v}: {reason}");
                    changes
                        .rejected_fields
                        .push(("minActivityConfidence".into(), reason));
                }
            }
        }
        if let Some(v) = patch.max_retry {
            next.max_retry = v;
            changes.changed_fields.push("maxRetry".into());
        }
        if let Some(v) = patch.retry_delay_ms {
            match Config::validate_field("retryDelayMs", v) {
                Ok(()) => {
                    next.retry_delay_ms = v;
                    changes.changed_fields.push("retryDelayMs".into());
                }
                Err(reason) => {
                    log::warn!("rejected retryDelayMs={v}: {reason}");
                    changes.rejected_fields.push(("retryDelayMs".into(), reason));
                }
            }
        }
        if let Some(v) = patch.max_retry_delay_ms {
            match Config::validate_field("maxRetryDelayMs", v) {
                Ok(()) => {
                    next.max_retry_delay_ms = v;
                    changes.changed_fields.push("maxRetryDelayMs".into());
                }
                Err(reason) => {
                    log::warn!("rejected maxRetryDelayMs={v}: {reason}");
                    changes
                        .rejected_fields
                        .push(("maxRetryDelayMs".into(), reason));
                }
            }
        }
        if let Some(v) = patch.http_timeout_ms {
            match Config::validate_field("httpTimeoutMs", v) {
                Ok(()) => {
                    next.http_timeout_ms = v;
                    changes.changed_fields.push("httpTimeoutMs".into());
                }
                Err(reason) => {
                    log::warn!("rejected httpTimeoutMs={v}: {reason}");
                    changes
                        .rejected_fields
                        .push(("httpTimeoutMs".into(), reason));
                }
            }
        }

        apply_field!(foreground_service, "foregroundService");
        apply_field!(notification_title, "notification.title");
        apply_field!(notification_text, "notification.text");
        apply_field!(
            activity_recognition_interval_ms,
            "activityRecognitionInterval"
        );
        apply_field!(distance_filter, "distanceFilter");
        apply_field!(stationary_radius, "stationaryRadius");
        apply_field!(motion_trigger_delay_ms, "motionTriggerDelay");
        apply_field!(stop_detection_delay_ms, "stopDetectionDelay");
        apply_field!(stop_timeout_minutes, "stopTimeoutMinutes");
        apply_field!(
            disable_motion_activity_updates,
            "disableMotionActivityUpdates"
        );
        apply_field!(disable_stop_detection, "disableStopDetection");
        apply_field!(trigger_activities, "triggerActivities");
        apply_field!(url, "url");
        apply_field!(method, "method");
        apply_field!(http_headers, "httpHeaders");
        apply_field!(http_root_property, "httpRootProperty");
        apply_field!(idempotency_header, "idempotencyHeader");
        apply_field!(auto_sync, "autoSync");
        apply_field!(batch_sync, "batchSync");
        apply_field!(max_batch_size, "maxBatchSize");
        apply_field!(auto_sync_threshold, "autoSyncThreshold");
        apply_field!(disable_auto_sync_on_cellular, "disableAutoSyncOnCellular");
        apply_field!(queue_max_days, "queueMaxDays");
        apply_field!(queue_max_records, "queueMaxRecords");
        apply_field!(retry_delay_multiplier, "retryDelayMultiplier");
        apply_field!(persist_mode, "persistMode");
        apply_field!(max_days_to_persist, "maxDaysToPersist");
        apply_field!(max_records_to_persist, "maxRecordsToPersist");
        apply_field!(schedule_enabled, "scheduleEnabled");
        apply_field!(schedule, "schedule");
        apply_field!(heartbeat_interval_seconds, "heartbeatIntervalSeconds");
        apply_field!(enable_headless, "enableHeadless");
        apply_field!(start_on_boot, "startOnBoot");
        apply_field!(stop_on_terminate, "stopOnTerminate");
        apply_field!(log_level, "logLevel");
        apply_field!(log_max_days, "logMaxDays");
        apply_field!(max_monitored_geofences, "maxMonitoredGeofences");
        apply_field!(desired_accuracy, "desiredAccuracy");

        self.persistence.save(&next)?;
        *self.current.write() = Arc::new(next);
        Ok(changes)
    }
}

/// Pure function implementing the PersistencePolicy table (§4.7).
pub fn should_persist(batch_sync: bool, persist_mode: PersistMode, event: EventName) -> bool {
    if batch_sync {
        return true;
    }
    match persist_mode {
        PersistMode::None => false,
        PersistMode::All => true,
        PersistMode::Geofence => event == EventName::Geofence,
        PersistMode::Location => event != EventName::Geofence,
    }
}
