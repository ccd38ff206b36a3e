//! MotionStateMachine (C4, §4.4): debounced moving/stationary classifier.
//!
//! Per §9's re-architecture guidance, listener callbacks are replaced with a
//! typed channel (`tokio::sync::mpsc`) carrying tagged `MotionEvent`s rather
//! than an object-based observer interface. Debounce timers are modeled as
//! the abstract "postDelayed + cancel" pattern §9 calls for: a timer is
//! "cancelled" by bumping a generation counter the armed task checks before
//! committing, which is logically equivalent to cancellation without racing
//! a real task-abort against an in-flight wakeup.

use crate::clock::Clock;
use crate::model::{Activity, ActivityType};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

/// Events the motion state machine emits on transitions (§4.4).
#[derive(Debug, Clone)]
pub enum MotionEvent {
    MotionChange(bool),
    ActivityChange(Activity),
}

/// Per-call debounce parameters, read fresh from `ConfigStore` by the caller
/// on every event so config changes take effect immediately.
#[derive(Debug, Clone, Copy)]
pub struct MotionConfig {
    pub min_activity_confidence: u8,
    pub motion_trigger_delay_ms: i64,
    pub stop_detection_delay_ms: i64,
    pub stop_timeout_minutes: i64,
    pub disable_stop_detection: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingTimer {
    None,
    Start,
    Stop,
}

struct State {
    moving: bool,
    last_activity: Activity,
    pending: PendingTimer,
}

/// C4: holds `moving`/`lastActivity` state and debounces transitions.
pub struct MotionStateMachine {
    state: Mutex<State>,
    generation: AtomicU64,
    clock: Arc<dyn Clock>,
    events: UnboundedSender<MotionEvent>,
}

impl MotionStateMachine {
    pub fn new(clock: Arc<dyn Clock>, events: UnboundedSender<MotionEvent>) -> Self {
        Self {
            state: Mutex::new(State {
                moving: false,
                last_activity: Activity {
                    activity_type: ActivityType::Unknown,
                    confidence: 0,
                },
                pending: PendingTimer::None,
            }),
            generation: AtomicU64::new(0),
            clock,
            events,
        }
    }

    pub fn is_moving(&self) -> bool {
        self.state.lock().moving
    }

    pub fn last_activity(&self) -> Activity {
        self.state.lock().last_activity
    }

    /// Handle an activity reading (§4.4 algorithm). Events below
    /// `config.min_activity_confidence` are rejected without state change.
    pub fn on_activity_event(
        self: &Arc<Self>,
        activity: Activity,
        trigger_activities: &[ActivityType],
        config: MotionConfig,
    ) {
        if activity.confidence < config.min_activity_confidence {
            return;
        }

        let next_moving = trigger_activities.contains(&activity.activity_type);
        let _ = self.events.send(MotionEvent::ActivityChange(activity));

        let mut state = self.state.lock();
        state.last_activity = activity;

        if next_moving {
            if state.moving {
                self.cancel_pending_locked(&mut state);
            } else {
                match state.pending {
                    PendingTimer::Start => { /* already armed, let it run */ }
                    PendingTimer::Stop => {
                        self.cancel_pending_locked(&mut state);
                        self.arm_start(&mut state, config.motion_trigger_delay_ms);
                    }
                    PendingTimer::None => {
                        self.arm_start(&mut state, config.motion_trigger_delay_ms);
                    }
                }
            }
        } else if state.moving {
            if state.pending == PendingTimer::Start {
                self.cancel_pending_locked(&mut state);
            }
            if config.disable_stop_detection {
                // stop transitions ignored entirely while this gate is set
            } else if state.pending != PendingTimer::Stop {
                let delay_ms = if config.stop_timeout_minutes > 0 {
                    config.stop_timeout_minutes * 60_000
                } else {
                    config.stop_detection_delay_ms
                };
                self.arm_stop(&mut state, delay_ms);
            }
        } else if state.pending == PendingTimer::Start {
            self.cancel_pending_locked(&mut state);
        }
    }

    /// Explicit external override (orchestrator `changePace`): commits
    /// immediately, bypassing debounce and cancelling any pending timer.
    pub fn force_moving(&self, moving: bool) {
        let mut state = self.state.lock();
        self.cancel_pending_locked(&mut state);
        self.commit_locked(&mut state, moving);
    }

    fn cancel_pending_locked(&self, state: &mut State) {
        state.pending = PendingTimer::None;
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    fn arm_start(self: &Arc<Self>, state: &mut State, delay_ms: i64) {
        if delay_ms <= 0 {
            self.commit_locked(state, true);
            return;
        }
        state.pending = PendingTimer::Start;
        self.spawn_commit(delay_ms, true);
    }

    fn arm_stop(self: &Arc<Self>, state: &mut State, delay_ms: i64) {
        if delay_ms <= 0 {
            self.commit_locked(state, false);
            return;
        }
        state.pending = PendingTimer::Stop;
        self.spawn_commit(delay_ms, false);
    }

    fn spawn_commit(self: &Arc<Self>, delay_ms: i64, target_moving: bool) {
        let this = Arc::clone(self);
        let my_gen = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms.max(0) as u64)).await;
            let mut state = this.state.lock();
            if this.generation.load(Ordering::SeqCst) != my_gen {
                return; // superseded by a later event
            }
            this.commit_locked(&mut state, target_moving);
        });
    }

    fn commit_locked(&self, state: &mut State, moving: bool) {
        let changed = state.moving != moving;
        state.moving = moving;
        state.pending = PendingTimer::None;
        if changed {
            let _ = self.events.send(MotionEvent::MotionChange(moving));
        }
    }
}

impl std::fmt::Debug for MotionStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MotionStateMachine")
            .field("moving", &state.moving)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    fn config(trigger_ms: i64, stop_timeout_minutes: i64) -> MotionConfig {
        MotionConfig {
            min_activity_confidence: 70,
            motion_trigger_delay_ms: trigger_ms,
            stop_detection_delay_ms: 0,
            stop_timeout_minutes,
            disable_stop_detection: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn debounced_start_and_stop_per_spec_scenario() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let sm = Arc::new(MotionStateMachine::new(Arc::new(SystemClock::new()), tx));
        let triggers = [ActivityType::Walking];
        let cfg = config(15_000, 5);

        sm.on_activity_event(
            Activity::new(ActivityType::Walking, 90).unwrap(),
            &triggers,
            cfg,
        );
        assert!(!sm.is_moving());

        tokio::time::advance(Duration::from_secs(10)).await;
        sm.on_activity_event(
            Activity::new(ActivityType::Walking, 90).unwrap(),
            &triggers,
            cfg,
        );
        assert!(!sm.is_moving(), "still pending at t=10s");

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(sm.is_moving(), "should have committed by t=15s+");

        sm.on_activity_event(
            Activity::new(ActivityType::Still, 90).unwrap(),
            &triggers,
            cfg,
        );
        assert!(sm.is_moving(), "stop timer armed, not yet committed");

        tokio::time::advance(Duration::from_secs(165)).await; // t ~= 3min after stop armed minus margin
        sm.on_activity_event(
            Activity::new(ActivityType::Walking, 90).unwrap(),
            &triggers,
            cfg,
        );
        assert!(sm.is_moving(), "moving candidate cancels stop timer");

        tokio::time::advance(Duration::from_secs(400)).await;
        // stop timer was cancelled, so no further auto-transition should fire
        assert!(sm.is_moving());

        let mut saw_motion_change_true = false;
        while let Ok(event) = rx.try_recv() {
            if let MotionEvent::MotionChange(true) = event {
                saw_motion_change_true = true;
            }
        }
        assert!(saw_motion_change_true);
    }

    #[tokio::test]
    async fn confidence_below_threshold_is_rejected() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let sm = Arc::new(MotionStateMachine::new(Arc::new(SystemClock::new()), tx));
        let triggers = [ActivityType::Walking];
        let cfg = config(0, 0);

        sm.on_activity_event(
            Activity::new(ActivityType::Walking, 69).unwrap(),
            &triggers,
            cfg,
        );
        assert!(!sm.is_moving());

        sm.on_activity_event(
            Activity::new(ActivityType::Walking, 70).unwrap(),
            &triggers,
            cfg,
        );
        assert!(sm.is_moving());
    }

    #[tokio::test]
    async fn zero_delay_commits_immediately() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let sm = Arc::new(MotionStateMachine::new(Arc::new(SystemClock::new()), tx));
        let triggers = [ActivityType::Walking];
        let cfg = config(0, 0);

        sm.on_activity_event(
            Activity::new(ActivityType::Walking, 90).unwrap(),
            &triggers,
            cfg,
        );
        assert!(sm.is_moving());
    }
}
