//! Scheduler (C6, §4.6): time-of-day windows that gate tracking on/off.

use crate::error::{CoreError, Result};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A parsed `"HH:MM-HH:MM"` window, stored as minute-of-day offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    start_minute: u32,
    end_minute: u32,
}

impl Window {
    /// Parse a window string like `"09:00-17:30"`.
    pub fn parse(spec: &str) -> Result<Self> {
        let (start, end) = spec.split_once('-').ok_or_else(|| {
            CoreError::InvalidInput(format!("schedule window {spec:?} missing '-'"))
        })?;
        Ok(Self {
            start_minute: parse_hhmm(start)?,
            end_minute: parse_hhmm(end)?,
        })
    }

    /// Is this window active at `minute_of_day` (0..1440)?
    pub fn is_active(&self, minute_of_day: u32) -> bool {
        if self.end_minute < self.start_minute {
            minute_of_day >= self.start_minute || minute_of_day < self.end_minute
        } else {
            minute_of_day >= self.start_minute && minute_of_day < self.end_minute
        }
    }
}

fn parse_hhmm(s: &str) -> Result<u32> {
    let (h, m) = s
        .split_once(':')
        .ok_or_else(|| CoreError::InvalidInput(format!("bad time {s:?}, expected HH:MM")))?;
    let h: u32 = h
        .parse()
        .map_err(|_| CoreError::InvalidInput(format!("bad hour in {s:?}")))?;
    let m: u32 = m
        .parse()
        .map_err(|_| CoreError::InvalidInput(format!("bad minute in {s:?}")))?;
    if h >= 24 || m >= 60 {
        return Err(CoreError::InvalidInput(format!(
            "time {s:?} out of range"
        )));
    }
    Ok(h * 60 + m)
}

/// C6: evaluates schedule windows and reports the desired enabled state.
pub struct Scheduler {
    windows: Vec<Window>,
    enabled: AtomicBool,
}

impl Scheduler {
    pub fn new(window_specs: &[String]) -> Result<Self> {
        let windows = window_specs
            .iter()
            .map(|s| Window::parse(s))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            windows,
            enabled: AtomicBool::new(false),
        })
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// `shouldBeEnabled = any window active` at `minute_of_day`.
    pub fn should_be_enabled(&self, minute_of_day: u32) -> bool {
        self.windows.iter().any(|w| w.is_active(minute_of_day))
    }

    /// Run `applyScheduleState()`: computes the desired state and invokes
    /// `listener(should_enable)`, which returns whether it actually realized
    /// that state (e.g. start()/stop() succeeded). The listener is async
    /// since realizing the state means awaiting `Orchestrator::start`/`stop`.
    pub async fn apply_schedule_state<F, Fut>(self: &Arc<Self>, minute_of_day: u32, listener: F) -> bool
    where
        F: FnOnce(bool) -> Fut,
        Fut: Future<Output = bool>,
    {
        let should_enable = self.should_be_enabled(minute_of_day);
        listener(should_enable).await
    }
}

fn minute_of_day_utc(now_ms: i64) -> u32 {
    let seconds_in_day = 24 * 60 * 60;
    let secs = ((now_ms / 1000) % seconds_in_day + seconds_in_day) % seconds_in_day;
    (secs / 60) as u32
}

/// Convenience: derive minute-of-day from a UTC epoch-millis timestamp. Real
/// local-time handling is the embedder's responsibility; the CORE operates
/// purely on minute-of-day offsets supplied by the caller.
pub fn minute_of_day_from_epoch_ms(now_ms: i64) -> u32 {
    minute_of_day_utc(now_ms)
}
