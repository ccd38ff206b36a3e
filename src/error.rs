//! Error types for the tracking engine.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Error kinds surfaced across component boundaries.
///
/// No component is allowed to panic on caller-reachable input; every public
/// entry point returns `Result<T>` built from one of these variants.
#[derive(Error, Debug)]
pub enum CoreError {
    /// The location/activity producer could not be started because the host
    /// denied the underlying OS permission. State is left unchanged.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A store or network operation failed in a way that is expected to
    /// succeed on retry (§4.8 backoff applies).
    #[error("transient I/O error: {0}")]
    TransientIo(String),

    /// A persisted record could not be read back (corrupt or unknown
    /// encoding). The record is skipped, not retried.
    #[error("permanent I/O error: {0}")]
    PermanentIo(String),

    /// A config patch contained an out-of-range value for one field; other
    /// fields in the same patch still applied.
    #[error("invalid config field `{field}`: {reason}")]
    InvalidConfig {
        /// Name of the offending field.
        field: String,
        /// Human-readable reason the value was rejected.
        reason: String,
    },

    /// The remote endpoint responded 401; DeliveryEngine auto-paused.
    #[error("authentication required")]
    AuthRequired,

    /// The engine has been released and is no longer usable.
    #[error("engine released")]
    Released,

    /// A geofence or queue identifier was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A caller-supplied identifier or value failed a structural check
    /// (e.g. a polygon with fewer than 3 vertices).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Wraps `std::io::Error` from the durable storage backend.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Wraps JSON (de)serialization failures.
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    /// A background worker observed a poisoned lock; this is always a bug,
    /// not a recoverable runtime condition, but it is still surfaced rather
    /// than unwound through a panic.
    #[error("internal lock poisoned: {0}")]
    LockPoisoned(String),

    /// Catch-all for conditions that don't fit another variant.
    #[error("{0}")]
    Other(String),
}

impl CoreError {
    /// True for kinds that §4.8/§7 treat as retryable rather than terminal.
    pub fn is_transient(&self) -> bool {
        matches!(self, CoreError::TransientIo(_))
    }
}
