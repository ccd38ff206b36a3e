//! DeliveryEngine (C8, §4.8): offline-first HTTP sync with single/batch/queue
//! paths, capped-exponential backoff, idempotency, and dead-lettering.
//!
//! The HTTP transport is a trait (`HttpTransport`) rather than a direct
//! `reqwest::Client` field, the same seam the storage layer puts in front of
//! its backend: it lets every §8 scenario run against a deterministic fake
//! transport instead of a real socket, while `ReqwestTransport` backs
//! production use.

use crate::clock::Clock;
use crate::config::{Config, ConfigStore};
use crate::dispatcher::{Event, EventDispatcher};
use crate::error::Result;
use crate::store::PersistentStore;
use crate::system_monitor::SystemMonitor;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

const DEFAULT_CONCURRENCY: usize = 4;

#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub url: String,
    pub method: String,
    pub headers: HashMap<String, String>,
    pub body: Value,
    pub timeout_ms: i64,
}

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body_text: String,
}

impl TransportResponse {
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_auth_required(&self) -> bool {
        self.status == 401
    }
}

/// The async HTTP boundary. `send` should never panic; transport failures
/// (DNS, connect, timeout) surface as `CoreError::TransientIo`.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: OutboundRequest) -> Result<TransportResponse>;
}

/// Production transport over `reqwest` (feature `http`).
#[cfg(feature = "http")]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

#[cfg(feature = "http")]
impl ReqwestTransport {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| crate::error::CoreError::Other(format!("building http client: {e}")))?;
        Ok(Self { client })
    }
}

#[cfg(feature = "http")]
#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: OutboundRequest) -> Result<TransportResponse> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .unwrap_or(reqwest::Method::POST);
        let mut builder = self
            .client
            .request(method, &request.url)
            .timeout(Duration::from_millis(request.timeout_ms.max(1) as u64))
            .json(&request.body);
        for (k, v) in &request.headers {
            builder = builder.header(k, v);
        }
        let response = builder.send().await.map_err(|e| {
            crate::error::CoreError::TransientIo(format!("http request failed: {e}"))
        })?;
        let status = response.status().as_u16();
        let body_text = response.text().await.unwrap_or_default();
        Ok(TransportResponse { status, body_text })
    }
}

/// Strip CR/LF and surrounding whitespace from a header key or value (§4.8).
fn sanitize_header(value: &str) -> String {
    value
        .chars()
        .filter(|c| *c != '\r' && *c != '\n')
        .collect::<String>()
        .trim()
        .to_string()
}

/// Optional gate evaluated before a send (§4.8). The CORE has no device
/// battery/charging signal of its own (out of scope per §1); the host
/// supplies an evaluator closure if it wants the gate enforced.
#[derive(Debug, Clone, Default)]
pub struct SyncPolicy {
    pub require_charging: bool,
    pub prefer_wifi: bool,
    pub low_battery_threshold: u8,
    pub min_batch_size: usize,
    pub max_batch_size: usize,
}

pub type SyncPolicyEvaluator = dyn Fn(&SyncPolicy) -> bool + Send + Sync;
pub type DynamicHeaderFn = dyn Fn() -> HashMap<String, String> + Send + Sync;

enum Outcome {
    Success,
    AuthRequired,
    Failure,
}

/// C8: single/batch/queue delivery paths over a bounded worker pool.
pub struct DeliveryEngine {
    config: Arc<ConfigStore>,
    store: Arc<PersistentStore>,
    clock: Arc<dyn Clock>,
    system_monitor: Arc<dyn SystemMonitor>,
    dispatcher: Arc<EventDispatcher>,
    transport: Arc<dyn HttpTransport>,
    semaphore: Arc<Semaphore>,
    paused: AtomicBool,
    released: AtomicBool,
    sync_policy: Mutex<Option<SyncPolicy>>,
    sync_policy_evaluator: Mutex<Option<Arc<SyncPolicyEvaluator>>>,
    dynamic_headers: Mutex<Option<Arc<DynamicHeaderFn>>>,
}

impl DeliveryEngine {
    pub fn new(
        config: Arc<ConfigStore>,
        store: Arc<PersistentStore>,
        clock: Arc<dyn Clock>,
        system_monitor: Arc<dyn SystemMonitor>,
        dispatcher: Arc<EventDispatcher>,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        Self {
            config,
            store,
            clock,
            system_monitor,
            dispatcher,
            transport,
            semaphore: Arc::new(Semaphore::new(DEFAULT_CONCURRENCY)),
            paused: AtomicBool::new(false),
            released: AtomicBool::new(false),
            sync_policy: Mutex::new(None),
            sync_policy_evaluator: Mutex::new(None),
            dynamic_headers: Mutex::new(None),
        }
    }

    pub fn set_sync_policy(&self, policy: Option<SyncPolicy>, evaluator: Option<Arc<SyncPolicyEvaluator>>) {
        *self.sync_policy.lock() = policy;
        *self.sync_policy_evaluator.lock() = evaluator;
    }

    pub fn set_dynamic_headers(&self, f: Option<Arc<DynamicHeaderFn>>) {
        *self.dynamic_headers.lock() = f;
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Clear the pause flag. The caller is expected to follow up with a sync
    /// attempt (batch/queue) to drain what accumulated while paused.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }

    fn policy_gate_passes(&self) -> bool {
        match (&*self.sync_policy.lock(), &*self.sync_policy_evaluator.lock()) {
            (Some(policy), Some(eval)) => eval(policy),
            _ => true,
        }
    }

    fn merged_headers(&self, config: &Config) -> HashMap<String, String> {
        let mut headers: HashMap<String, String> = config
            .http_headers
            .iter()
            .map(|(k, v)| (sanitize_header(k), sanitize_header(v)))
            .collect();
        if let Some(dynamic) = self.dynamic_headers.lock().clone() {
            for (k, v) in dynamic() {
                headers.insert(sanitize_header(&k), sanitize_header(&v));
            }
        }
        headers
    }

    async fn execute(&self, config: &Config, body: Value, idempotency_key: Option<&str>) -> Outcome {
        let Some(url) = config.url.clone() else {
            return Outcome::Failure;
        };
        let mut headers = self.merged_headers(config);
        if let Some(key) = idempotency_key {
            headers.insert(config.idempotency_header.clone(), key.to_string());
        }

        let _permit = self.semaphore.acquire().await;
        let request = OutboundRequest {
            url,
            method: config.method.clone(),
            headers,
            body,
            timeout_ms: config.http_timeout_ms,
        };

        let response = match self.transport.send(request).await {
            Ok(r) => r,
            Err(e) => {
                log::warn!("delivery request failed: {e}");
                self.emit_http_event(0, false, String::new());
                return Outcome::Failure;
            }
        };

        self.emit_http_event(response.status, response.ok(), response.body_text.clone());

        if response.is_auth_required() {
            Outcome::AuthRequired
        } else if response.ok() {
            Outcome::Success
        } else {
            Outcome::Failure
        }
    }

    fn emit_http_event(&self, status: u16, ok: bool, response_text: String) {
        self.dispatcher.send_event(Event::new(
            "http",
            json!({ "status": status, "ok": ok, "responseText": response_text }),
        ));
    }

    fn merge_params_extras(mut body: serde_json::Map<String, Value>, config: &Config) -> Value {
        if let Value::Object(params) = &config.http_params {
            for (k, v) in params {
                body.insert(k.clone(), v.clone());
            }
        }
        if let Value::Object(extras) = &config.http_extras {
            for (k, v) in extras {
                body.insert(k.clone(), v.clone());
            }
        }
        Value::Object(body)
    }

    /// §4.8 Single path: POST one location envelope.
    pub async fn sync_now(&self, payload: Option<Value>) -> Result<()> {
        if self.released.load(Ordering::SeqCst) {
            return Err(crate::error::CoreError::Released);
        }
        if self.paused.load(Ordering::SeqCst) || !self.policy_gate_passes() {
            return Ok(());
        }
        let config = self.config.snapshot();
        if !config.auto_sync || config.url.is_none() {
            return Ok(());
        }
        if !self.system_monitor.is_auto_sync_allowed(&config) {
            return Ok(());
        }

        let root = config.http_root_property.clone().unwrap_or_else(|| "location".to_string());
        let mut map = serde_json::Map::new();
        map.insert(root, payload.unwrap_or(Value::Null));
        let body = Self::merge_params_extras(map, &config);

        match self.execute(&config, body, None).await {
            Outcome::Success => Ok(()),
            Outcome::AuthRequired => {
                self.pause();
                Ok(())
            }
            Outcome::Failure => Ok(()),
        }
    }

    /// §4.8 Batch path: read up to `max(autoSyncThreshold, maxBatchSize)`
    /// pending locations; only send once the effective threshold is met.
    pub async fn attempt_batch_sync(&self) -> Result<()> {
        if self.released.load(Ordering::SeqCst) {
            return Err(crate::error::CoreError::Released);
        }
        if self.paused.load(Ordering::SeqCst) || !self.policy_gate_passes() {
            return Ok(());
        }
        let config = self.config.snapshot();
        if !self.system_monitor.is_auto_sync_allowed(&config) {
            return Ok(());
        }

        let effective_threshold = if config.auto_sync_threshold > 0 {
            config.auto_sync_threshold
        } else {
            config.max_batch_size
        };
        let read_limit = config.auto_sync_threshold.max(config.max_batch_size);
        let mut pending = self.store.read_locations(Some(read_limit))?;
        if pending.len() < effective_threshold {
            return Ok(());
        }

        pending.sort_by_key(|l| l.timestamp);
        pending.truncate(config.max_batch_size);
        let ids: Vec<String> = pending.iter().map(|l| l.uuid.clone()).collect();
        let payloads: Vec<Value> = pending
            .iter()
            .map(|l| serde_json::to_value(l).unwrap_or(Value::Null))
            .collect();

        let root = config.http_root_property.clone().unwrap_or_else(|| "locations".to_string());
        let mut map = serde_json::Map::new();
        map.insert(root, Value::Array(payloads));
        let body = Self::merge_params_extras(map, &config);

        match self.execute(&config, body, None).await {
            Outcome::Success => self.store.delete_locations(&ids),
            Outcome::AuthRequired => {
                self.pause();
                Ok(())
            }
            Outcome::Failure => Ok(()),
        }
    }

    /// §4.8 Queue path: send items with `nextRetryAt <= now`, oldest first.
    pub async fn sync_queue(&self, limit: Option<usize>) -> Result<()> {
        if self.released.load(Ordering::SeqCst) {
            return Err(crate::error::CoreError::Released);
        }
        if self.paused.load(Ordering::SeqCst) || !self.policy_gate_passes() {
            return Ok(());
        }
        let config = self.config.snapshot();
        if !self.system_monitor.is_auto_sync_allowed(&config) {
            return Ok(());
        }

        let now_ms = self.clock.now_ms();
        let due = self.store.read_due_queue(now_ms, limit)?;

        for item in due {
            if self.paused.load(Ordering::SeqCst) {
                break;
            }
            let root = config.http_root_property.clone().unwrap_or_else(|| "payload".to_string());
            let mut map = serde_json::Map::new();
            map.insert(root, item.payload.clone());
            map.insert("queueId".to_string(), json!(item.id));
            if let Some(item_type) = &item.item_type {
                map.insert("type".to_string(), json!(item_type));
            }
            map.insert("idempotencyKey".to_string(), json!(item.idempotency_key));
            let body = Self::merge_params_extras(map, &config);

            match self.execute(&config, body, Some(&item.idempotency_key)).await {
                Outcome::Success => {
                    self.store.delete_queue_by_ids(&[item.id.clone()])?;
                }
                Outcome::AuthRequired => {
                    self.pause();
                    break;
                }
                Outcome::Failure => {
                    let attempt = item.retry_count + 1;
                    if attempt > config.max_retry {
                        self.store.move_to_dead_letter(&item.id, now_ms)?;
                    } else {
                        let delay = compute_backoff_delay(
                            config.retry_delay_ms,
                            config.retry_delay_multiplier,
                            config.max_retry_delay_ms,
                            attempt,
                        );
                        self.store.update_retry(&item.id, attempt, now_ms + delay)?;
                    }
                }
            }
        }
        Ok(())
    }
}

/// `delay = clamp(retryDelayMs * multiplier^(attempt-1), retryDelayMs, maxRetryDelayMs)` (§4.8).
pub fn compute_backoff_delay(
    retry_delay_ms: i64,
    retry_delay_multiplier: f64,
    max_retry_delay_ms: i64,
    attempt: u32,
) -> i64 {
    let raw = retry_delay_ms as f64 * retry_delay_multiplier.powi(attempt as i32 - 1);
    raw.clamp(retry_delay_ms as f64, max_retry_delay_ms as f64) as i64
}
