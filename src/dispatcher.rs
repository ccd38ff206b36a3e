//! EventDispatcher + HeadlessDispatcher (C10, §4.10): fans out typed events
//! to at most one live sink, falling back to a headless handoff when the
//! embedding app is suspended.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

/// Outbound event envelope (§6): `{ type, data }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Value,
}

impl Event {
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
        }
    }
}

/// The two opaque 64-bit identifiers the embedding app persists to resume a
/// headless callback after process restart (§9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadlessHandles {
    pub dispatcher_handle: u64,
    pub callback_handle: u64,
}

/// Holds events destined for a suspended app's pre-registered callback. The
/// CORE never invokes platform callback machinery itself; it only tracks
/// whether headless delivery is enabled and queues events for the host to
/// drain via `take_pending()`.
#[derive(Default)]
pub struct HeadlessDispatcher {
    handles: Mutex<Option<HeadlessHandles>>,
    enabled: AtomicBool,
    pending: Mutex<VecDeque<Event>>,
}

impl HeadlessDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handles: HeadlessHandles) {
        *self.handles.lock() = Some(handles);
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn handles(&self) -> Option<HeadlessHandles> {
        *self.handles.lock()
    }

    /// Enqueue `event` for later draining, or drop it with a debug log if
    /// headless delivery is disabled or no handles are registered.
    pub fn dispatch(&self, event: Event) {
        if !self.enabled.load(Ordering::SeqCst) || self.handles.lock().is_none() {
            log::debug!("dropping event {:?}: headless disabled or unregistered", event.event_type);
            return;
        }
        self.pending.lock().push_back(event);
    }

    /// Drain every event queued since the last drain, oldest first.
    pub fn take_pending(&self) -> Vec<Event> {
        self.pending.lock().drain(..).collect()
    }
}

/// C10: holds at most one live sink; falls back to `HeadlessDispatcher`.
pub struct EventDispatcher {
    sink: Mutex<Option<UnboundedSender<Event>>>,
    headless: Arc<HeadlessDispatcher>,
}

impl EventDispatcher {
    pub fn new(headless: Arc<HeadlessDispatcher>) -> Self {
        Self {
            sink: Mutex::new(None),
            headless,
        }
    }

    /// Swap or clear the live sink. In-flight events already handed to the
    /// previous sink's channel are unaffected (§4.10).
    pub fn set_sink(&self, sink: Option<UnboundedSender<Event>>) {
        *self.sink.lock() = sink;
    }

    pub fn has_sink(&self) -> bool {
        self.sink.lock().is_some()
    }

    /// Deliver `event` to the live sink if registered, else to headless.
    pub fn send_event(&self, event: Event) {
        let sink = self.sink.lock().clone();
        match sink {
            Some(sender) => {
                if sender.send(event).is_err() {
                    log::debug!("live sink channel closed, event dropped");
                }
            }
            None => self.headless.dispatch(event),
        }
    }
}
