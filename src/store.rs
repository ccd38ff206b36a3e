//! PersistentStore (C2, §4.2): the typed record store built atop a
//! `StorageBackend`. Every table is key-namespaced within one shared backend
//! (`crate::namespace::Table`); the serialization format on disk is JSON,
//! which is an implementation detail the contract in §4.2 explicitly leaves
//! open.
//!
//! Concurrency: a single `parking_lot::Mutex` around the backend gives the
//! "serialized through an internal queue" guarantee §4.2 asks for. The spec
//! allows one dedicated serial queue per table; a single mutex is a strictly
//! stronger (and much simpler) serialization that still satisfies every
//! ordering and durability property in §5 and §8, so the per-table queue
//! was not built out — see DESIGN.md.

use crate::config::{Config, ConfigPersistence};
use crate::error::{CoreError, Result};
use crate::model::{DeadLetter, Location, LogEntry, QueueItem, TripState};
use crate::namespace::Table;
use crate::storage::StorageBackend;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const DEAD_LETTER_CAP: usize = 100;
const MS_PER_DAY: i64 = 86_400_000;

/// Either shape persisted in the `geofences` table: circular or polygon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum PersistedGeofence {
    Circular(crate::model::Geofence),
    Polygon(crate::model::PolygonGeofence),
}

impl PersistedGeofence {
    pub fn identifier(&self) -> &str {
        match self {
            PersistedGeofence::Circular(g) => &g.identifier,
            PersistedGeofence::Polygon(g) => &g.identifier,
        }
    }
}

pub struct PersistentStore {
    backend: Mutex<Box<dyn StorageBackend>>,
    log_seq: AtomicU64,
}

impl PersistentStore {
    pub fn new(backend: Box<dyn StorageBackend>) -> Self {
        Self {
            backend: Mutex::new(backend),
            log_seq: AtomicU64::new(0),
        }
    }

    fn get_json<T: for<'de> Deserialize<'de>>(&self, key: &[u8]) -> Result<Option<T>> {
        let backend = self.backend.lock();
        match backend.get(key)? {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .map_err(|e| CoreError::PermanentIo(format!("corrupt record: {e}")))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn put_json<T: Serialize>(&self, key: &[u8], value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.backend.lock().put(key, &bytes)
    }

    fn scan_table<T: for<'de> Deserialize<'de>>(&self, table: Table) -> Result<Vec<T>> {
        let backend = self.backend.lock();
        let rows = backend.scan_prefix(&table.key_prefix())?;
        drop(backend);
        let mut out = Vec::with_capacity(rows.len());
        for (_, value) in rows {
            match serde_json::from_slice(&value) {
                Ok(v) => out.push(v),
                Err(e) => {
                    log::error!("skipping corrupt record in {table:?}: {e}");
                }
            }
        }
        Ok(out)
    }

    // ---- Locations ----------------------------------------------------

    /// Idempotent on `location.uuid` per the global invariant in §3.
    pub fn insert_location(&self, location: &Location) -> Result<()> {
        self.put_json(&Table::Locations.key(&location.uuid), location)
    }

    /// Newest-first by timestamp.
    pub fn read_locations(&self, limit: Option<usize>) -> Result<Vec<Location>> {
        let mut rows: Vec<Location> = self.scan_table(Table::Locations)?;
        rows.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        if let Some(limit) = limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    pub fn delete_locations(&self, ids: &[String]) -> Result<()> {
        let mut backend = self.backend.lock();
        for id in ids {
            backend.delete(&Table::Locations.key(id))?;
        }
        Ok(())
    }

    pub fn clear_locations(&self) -> Result<()> {
        let ids: Vec<String> = self
            .read_locations(None)?
            .into_iter()
            .map(|l| l.uuid)
            .collect();
        self.delete_locations(&ids)
    }

    /// Prune-by-age precedes prune-by-count; count-based pruning retains
    /// the newest `max_records` by timestamp (§4.2, §8).
    pub fn prune_locations(&self, now_ms: i64, max_days: i64, max_records: usize) -> Result<usize> {
        let mut rows = self.read_locations(None)?;
        let before = rows.len();

        if max_days > 0 {
            let cutoff = now_ms - max_days * MS_PER_DAY;
            let cutoff = chrono::DateTime::from_timestamp_millis(cutoff)
                .unwrap_or_else(|| chrono::DateTime::from_timestamp_millis(0).unwrap());
            rows.retain(|l| l.timestamp >= cutoff);
        }
        // rows is newest-first already; retain the newest max_records.
        if max_records > 0 && rows.len() > max_records {
            rows.truncate(max_records);
        }

        let keep: std::collections::HashSet<String> =
            rows.into_iter().map(|l| l.uuid).collect();
        let all = self.read_locations(None)?;
        let to_delete: Vec<String> = all
            .into_iter()
            .map(|l| l.uuid)
            .filter(|uuid| !keep.contains(uuid))
            .collect();
        let pruned = to_delete.len();
        self.delete_locations(&to_delete)?;
        debug_assert!(pruned <= before);
        Ok(pruned)
    }

    // ---- Queue ----------------------------------------------------------

    /// Rejected (returns the existing id) if `idempotency_key` already
    /// identifies an unsent queue item (§4.2).
    #[allow(clippy::too_many_arguments)]
    pub fn enqueue(
        &self,
        payload: serde_json::Value,
        item_type: Option<String>,
        idempotency_key: String,
        new_id: String,
        now_ms: i64,
        queue_max_days: i64,
        queue_max_records: usize,
    ) -> Result<String> {
        let existing = self
            .read_queue(None)?
            .into_iter()
            .find(|item| item.idempotency_key == idempotency_key);
        if let Some(existing) = existing {
            return Ok(existing.id);
        }

        let item = QueueItem {
            id: new_id.clone(),
            payload,
            item_type,
            idempotency_key,
            retry_count: 0,
            next_retry_at_ms: now_ms,
            created_at_ms: now_ms,
        };
        self.put_json(&Table::Queue.key(&item.id), &item)?;
        self.prune_queue(now_ms, queue_max_days, queue_max_records)?;
        Ok(new_id)
    }

    /// Oldest-first by `created_at_ms`.
    pub fn read_queue(&self, limit: Option<usize>) -> Result<Vec<QueueItem>> {
        let mut rows: Vec<QueueItem> = self.scan_table(Table::Queue)?;
        rows.sort_by_key(|item| item.created_at_ms);
        if let Some(limit) = limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    /// Queue items due for retry, ascending `created_at_ms` (§5 ordering
    /// guarantee).
    pub fn read_due_queue(&self, now_ms: i64, limit: Option<usize>) -> Result<Vec<QueueItem>> {
        let mut rows = self.read_queue(None)?;
        rows.retain(|item| item.next_retry_at_ms <= now_ms);
        if let Some(limit) = limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    /// Enforces the monotonic-non-decreasing invariant on `retry_count` and
    /// `next_retry_at_ms` regardless of what the caller passes (§3).
    pub fn update_retry(&self, id: &str, retry_count: u32, next_retry_at_ms: i64) -> Result<()> {
        let key = Table::Queue.key(id);
        let mut item: QueueItem = self
            .get_json(&key)?
            .ok_or_else(|| CoreError::NotFound(format!("queue item {id}")))?;
        item.retry_count = item.retry_count.max(retry_count);
        item.next_retry_at_ms = item.next_retry_at_ms.max(next_retry_at_ms);
        self.put_json(&key, &item)
    }

    pub fn delete_queue_by_ids(&self, ids: &[String]) -> Result<()> {
        let mut backend = self.backend.lock();
        for id in ids {
            backend.delete(&Table::Queue.key(id))?;
        }
        Ok(())
    }

    pub fn clear_queue(&self) -> Result<()> {
        let ids: Vec<String> = self.read_queue(None)?.into_iter().map(|i| i.id).collect();
        self.delete_queue_by_ids(&ids)
    }

    fn prune_queue(&self, now_ms: i64, max_days: i64, max_records: usize) -> Result<()> {
        let mut rows = self.read_queue(None)?;
        if max_days > 0 {
            let cutoff = now_ms - max_days * MS_PER_DAY;
            rows.retain(|item| item.created_at_ms >= cutoff);
        }
        if max_records > 0 && rows.len() > max_records {
            // rows is oldest-first; keep the newest max_records.
            let drop_count = rows.len() - max_records;
            rows.drain(0..drop_count);
        }
        let keep: std::collections::HashSet<String> = rows.into_iter().map(|i| i.id).collect();
        let all = self.read_queue(None)?;
        let to_delete: Vec<String> = all
            .into_iter()
            .map(|i| i.id)
            .filter(|id| !keep.contains(id))
            .collect();
        self.delete_queue_by_ids(&to_delete)
    }

    // ---- Dead-letter ------------------------------------------------------

    /// Transactionally removes `id` from the queue and appends it to the
    /// dead-letter table, bounded to the newest 100 by `failed_at_ms` (§4.2).
    pub fn move_to_dead_letter(&self, id: &str, failed_at_ms: i64) -> Result<()> {
        let queue_key = Table::Queue.key(id);
        let item: QueueItem = self
            .get_json(&queue_key)?
            .ok_or_else(|| CoreError::NotFound(format!("queue item {id}")))?;
        let dead_letter = DeadLetter {
            item,
            failed_at_ms,
        };
        let dl_bytes = serde_json::to_vec(&dead_letter)?;

        {
            let mut backend = self.backend.lock();
            backend.batch(&[
                crate::storage::StorageOp::Delete {
                    key: queue_key.clone(),
                },
                crate::storage::StorageOp::Put {
                    key: Table::DeadLetter.key(id),
                    value: dl_bytes.into(),
                },
            ])?;
        }
        self.enforce_dead_letter_cap()
    }

    fn enforce_dead_letter_cap(&self) -> Result<()> {
        let mut rows: Vec<DeadLetter> = self.scan_table(Table::DeadLetter)?;
        if rows.len() <= DEAD_LETTER_CAP {
            return Ok(());
        }
        rows.sort_by_key(|d| d.failed_at_ms);
        let drop_count = rows.len() - DEAD_LETTER_CAP;
        let to_delete: Vec<String> = rows
            .into_iter()
            .take(drop_count)
            .map(|d| d.item.id)
            .collect();
        let mut backend = self.backend.lock();
        for id in to_delete {
            backend.delete(&Table::DeadLetter.key(&id))?;
        }
        Ok(())
    }

    pub fn read_dead_letters(&self) -> Result<Vec<DeadLetter>> {
        let mut rows: Vec<DeadLetter> = self.scan_table(Table::DeadLetter)?;
        rows.sort_by(|a, b| b.failed_at_ms.cmp(&a.failed_at_ms));
        Ok(rows)
    }

    // ---- Logs -------------------------------------------------------------

    pub fn append_log(&self, entry: LogEntry) -> Result<()> {
        let seq = self.log_seq.fetch_add(1, Ordering::Relaxed);
        let key = Table::Logs.key(&format!("{:020}-{:020}", entry.timestamp_ms, seq));
        self.put_json(&key, &entry)
    }

    pub fn read_logs(&self, limit: Option<usize>) -> Result<Vec<LogEntry>> {
        let mut rows: Vec<LogEntry> = self.scan_table(Table::Logs)?;
        rows.sort_by_key(|e| std::cmp::Reverse(e.timestamp_ms));
        if let Some(limit) = limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    pub fn prune_logs(&self, now_ms: i64, max_days: i64) -> Result<()> {
        if max_days <= 0 {
            return Ok(());
        }
        let cutoff = now_ms - max_days * MS_PER_DAY;
        let backend_rows = {
            let backend = self.backend.lock();
            backend.scan_prefix(&Table::Logs.key_prefix())?
        };
        let mut backend = self.backend.lock();
        for (key, value) in backend_rows {
            if let Ok(entry) = serde_json::from_slice::<LogEntry>(&value) {
                if entry.timestamp_ms < cutoff {
                    backend.delete(&key)?;
                }
            }
        }
        Ok(())
    }

    // ---- Odometer / trip-state --------------------------------------------

    pub fn get_odometer(&self) -> Result<f64> {
        Ok(self.get_json(&Table::Odometer.slot_key())?.unwrap_or(0.0))
    }

    pub fn set_odometer(&self, value: f64) -> Result<()> {
        self.put_json(&Table::Odometer.slot_key(), &value)
    }

    pub fn get_trip_state(&self) -> Result<Option<TripState>> {
        self.get_json(&Table::TripState.slot_key())
    }

    pub fn set_trip_state(&self, trip: &TripState) -> Result<()> {
        self.put_json(&Table::TripState.slot_key(), trip)
    }

    // ---- Geofences ----------------------------------------------------------

    pub fn save_geofence(&self, geofence: &PersistedGeofence) -> Result<()> {
        self.put_json(&Table::Geofences.key(geofence.identifier()), geofence)
    }

    pub fn list_geofences(&self) -> Result<Vec<PersistedGeofence>> {
        self.scan_table(Table::Geofences)
    }

    pub fn delete_geofence(&self, identifier: &str) -> Result<()> {
        self.backend
            .lock()
            .delete(&Table::Geofences.key(identifier))?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.backend.lock().sync()
    }
}

impl ConfigPersistence for PersistentStore {
    fn save(&self, config: &Config) -> Result<()> {
        self.put_json(&Table::Config.slot_key(), config)
    }

    fn load(&self) -> Result<Option<Config>> {
        self.get_json(&Table::Config.slot_key())
    }
}

/// Convenience constructor wiring an in-memory backend; mainly for tests.
pub fn in_memory_store() -> Arc<PersistentStore> {
    Arc::new(PersistentStore::new(Box::new(
        crate::storage::memory::MemoryBackend::new(),
    )))
}

/// Convenience constructor wiring an AOF-backed durable store.
#[cfg(feature = "aof")]
pub fn aof_store<P: AsRef<std::path::Path>>(path: P) -> Result<Arc<PersistentStore>> {
    Ok(Arc::new(PersistentStore::new(Box::new(
        crate::storage::aof::AofBackend::open(path)?,
    ))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ActivityType, Coords, EventName, LogLevel};
    use chrono::Utc;

    fn sample_location(uuid: &str, offset_secs: i64) -> Location {
        Location {
            uuid: uuid.to_string(),
            timestamp: Utc::now() + chrono::Duration::seconds(offset_secs),
            coords: Coords::new(1.0, 2.0, 5.0).unwrap(),
            activity: None,
            is_moving: Some(true),
            event: EventName::Location,
            odometer: 0.0,
            extras: None,
        }
    }

    #[test]
    fn location_insert_read_is_newest_first() {
        let store = in_memory_store();
        store.insert_location(&sample_location("a", 0)).unwrap();
        store.insert_location(&sample_location("b", 10)).unwrap();

        let rows = store.read_locations(None).unwrap();
        assert_eq!(rows[0].uuid, "b");
        assert_eq!(rows[1].uuid, "a");
    }

    #[test]
    fn count_based_prune_retains_newest() {
        let store = in_memory_store();
        for i in 0..5 {
            store
                .insert_location(&sample_location(&format!("loc{i}"), i))
                .unwrap();
        }
        store.prune_locations(0, 0, 3).unwrap();
        let rows = store.read_locations(None).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].uuid, "loc4");
        assert_eq!(rows[2].uuid, "loc2");
    }

    #[test]
    fn enqueue_with_repeated_idempotency_key_returns_existing_id() {
        let store = in_memory_store();
        let id1 = store
            .enqueue(
                serde_json::json!({"a":1}),
                None,
                "idem-1".to_string(),
                "id-1".to_string(),
                0,
                7,
                100,
            )
            .unwrap();
        let id2 = store
            .enqueue(
                serde_json::json!({"a":2}),
                None,
                "idem-1".to_string(),
                "id-2".to_string(),
                10,
                7,
                100,
            )
            .unwrap();
        assert_eq!(id1, id2);
        assert_eq!(store.read_queue(None).unwrap().len(), 1);
    }

    #[test]
    fn update_retry_is_monotonic_non_decreasing() {
        let store = in_memory_store();
        let id = store
            .enqueue(
                serde_json::json!({}),
                None,
                "k".to_string(),
                "id-1".to_string(),
                0,
                7,
                100,
            )
            .unwrap();
        store.update_retry(&id, 3, 5_000).unwrap();
        store.update_retry(&id, 1, 1_000).unwrap(); // lower values must not regress
        let item = store
            .read_queue(None)
            .unwrap()
            .into_iter()
            .find(|i| i.id == id)
            .unwrap();
        assert_eq!(item.retry_count, 3);
        assert_eq!(item.next_retry_at_ms, 5_000);
    }

    #[test]
    fn move_to_dead_letter_is_transactional() {
        let store = in_memory_store();
        let id = store
            .enqueue(
                serde_json::json!({}),
                None,
                "k".to_string(),
                "id-1".to_string(),
                0,
                7,
                100,
            )
            .unwrap();
        store.move_to_dead_letter(&id, 42).unwrap();

        assert!(store.read_queue(None).unwrap().is_empty());
        let dl = store.read_dead_letters().unwrap();
        assert_eq!(dl.len(), 1);
        assert_eq!(dl[0].failed_at_ms, 42);
    }

    #[test]
    fn dead_letter_bounded_to_newest_100() {
        let store = in_memory_store();
        for i in 0..110 {
            let id = store
                .enqueue(
                    serde_json::json!({}),
                    None,
                    format!("k{i}"),
                    format!("id-{i}"),
                    i,
                    0,
                    1000,
                )
                .unwrap();
            store.move_to_dead_letter(&id, i).unwrap();
        }
        let dl = store.read_dead_letters().unwrap();
        assert_eq!(dl.len(), 100);
        assert_eq!(dl[0].failed_at_ms, 109);
    }

    #[test]
    fn logs_prune_by_age() {
        let store = in_memory_store();
        store
            .append_log(LogEntry {
                timestamp_ms: 0,
                level: LogLevel::Info,
                message: "old".into(),
                tag: None,
            })
            .unwrap();
        store
            .append_log(LogEntry {
                timestamp_ms: 10 * MS_PER_DAY,
                level: LogLevel::Info,
                message: "new".into(),
                tag: None,
            })
            .unwrap();

        store.prune_logs(10 * MS_PER_DAY, 3).unwrap();
        let rows = store.read_logs(None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].message, "new");
    }

    #[test]
    fn config_persistence_round_trips() {
        let store = in_memory_store();
        let cfg = Config {
            max_retry: 9,
            ..Default::default()
        };
        store.save(&cfg).unwrap();
        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.max_retry, 9);
    }

    #[test]
    fn activity_type_used_for_compile_sanity() {
        let _ = ActivityType::Walking;
    }
}
