//! Key-prefixing for the PersistentStore's fixed table set (§4.2, §6).
//!
//! Adapted from the reference crate's general-purpose `Namespace`: this crate
//! only ever needs five fixed tables plus two single-slot records, so the
//! namespace set is a closed enum rather than an arbitrary registry.

use bytes::Bytes;

const SEPARATOR: &str = "::";

/// The fixed logical tables backing `PersistentStore` (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Locations,
    Geofences,
    Queue,
    DeadLetter,
    Logs,
    /// Single-slot persisted odometer value.
    Odometer,
    /// Single-slot persisted trip-state snapshot.
    TripState,
    /// Single-slot persisted config snapshot (backs `ConfigPersistence`).
    Config,
}

impl Table {
    fn prefix(&self) -> &'static str {
        match self {
            Table::Locations => "locations",
            Table::Geofences => "geofences",
            Table::Queue => "queue",
            Table::DeadLetter => "dead_letter",
            Table::Logs => "logs",
            Table::Odometer => "odometer",
            Table::TripState => "trip_state",
            Table::Config => "config",
        }
    }

    /// Build the full storage key for a record id within this table.
    pub fn key(&self, id: &str) -> Bytes {
        Bytes::from(format!("{}{SEPARATOR}{id}", self.prefix()))
    }

    /// The byte prefix used for `keys_with_prefix`/`scan_prefix` over this
    /// table.
    pub fn key_prefix(&self) -> Bytes {
        Bytes::from(format!("{}{SEPARATOR}", self.prefix()))
    }

    /// The fixed key for single-slot tables (odometer, trip-state, config).
    pub fn slot_key(&self) -> Bytes {
        self.key("singleton")
    }

    /// Strip this table's prefix from a full key, returning the record id.
    pub fn strip_prefix<'a>(&self, full_key: &'a [u8]) -> Option<&'a [u8]> {
        full_key.strip_prefix(self.key_prefix().as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_round_trips_through_strip_prefix() {
        let key = Table::Queue.key("abc-123");
        let id = Table::Queue.strip_prefix(&key).unwrap();
        assert_eq!(id, b"abc-123");
    }

    #[test]
    fn different_tables_never_share_a_prefix() {
        assert!(Table::Queue.strip_prefix(&Table::DeadLetter.key("x")).is_none());
    }

    #[test]
    fn slot_key_is_stable() {
        assert_eq!(Table::Odometer.slot_key(), Table::Odometer.slot_key());
    }
}
