//! Clock & RNG (C3): injected time sources and identifier generation.
//!
//! All time arithmetic elsewhere in the crate goes through `now_ms()`;
//! `monotonic()` backs ordering decisions where wall-clock jumps could
//! reverse a step (debounce timers, backoff delays).

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Abstract time source and identifier generator.
///
/// Implementations must be cheap to clone (`Arc`-wrapped internally) since a
/// `Clock` handle is threaded through every timer-owning component.
pub trait Clock: Send + Sync {
    /// Wall-clock milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64;

    /// Monotonic milliseconds from an arbitrary, implementation-defined
    /// origin. Only deltas between two calls are meaningful.
    fn monotonic_ms(&self) -> i64;

    /// A fresh, globally-unique identifier (UUIDv4 textual form).
    fn new_uuid(&self) -> String;
}

/// Production clock backed by the OS wall clock and a monotonic `Instant`.
#[derive(Debug, Clone, Default)]
pub struct SystemClock {
    origin: OnceInstant,
}

#[derive(Debug, Clone)]
struct OnceInstant(Arc<Instant>);

impl Default for OnceInstant {
    fn default() -> Self {
        Self(Arc::new(Instant::now()))
    }
}

impl SystemClock {
    /// Create a new system clock; the monotonic origin is fixed at creation.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }

    fn monotonic_ms(&self) -> i64 {
        self.origin.0.elapsed().as_millis() as i64
    }

    fn new_uuid(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

/// Deterministic clock for tests: wall and monotonic time only advance when
/// `advance()` is called, and uuids are sequential rather than random so test
/// assertions can reference exact identifiers.
#[derive(Debug, Clone)]
pub struct FakeClock {
    inner: Arc<Mutex<FakeClockState>>,
}

#[derive(Debug)]
struct FakeClockState {
    now_ms: i64,
    monotonic_ms: i64,
    next_uuid: u64,
}

impl FakeClock {
    /// Create a fake clock starting at the given wall-clock millis.
    pub fn new(start_ms: i64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(FakeClockState {
                now_ms: start_ms,
                monotonic_ms: 0,
                next_uuid: 0,
            })),
        }
    }

    /// Advance both wall and monotonic time by `delta_ms`.
    pub fn advance(&self, delta_ms: i64) {
        let mut state = self.inner.lock();
        state.now_ms += delta_ms;
        state.monotonic_ms += delta_ms;
    }

    /// Set the wall clock to an arbitrary value without affecting monotonic
    /// time, to simulate a clock jump.
    pub fn jump_to(&self, now_ms: i64) {
        self.inner.lock().now_ms = now_ms;
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Clock for FakeClock {
    fn now_ms(&self) -> i64 {
        self.inner.lock().now_ms
    }

    fn monotonic_ms(&self) -> i64 {
        self.inner.lock().monotonic_ms
    }

    fn new_uuid(&self) -> String {
        let mut state = self.inner.lock();
        let id = state.next_uuid;
        state.next_uuid += 1;
        format!("00000000-0000-4000-8000-{id:012x}")
    }
}
