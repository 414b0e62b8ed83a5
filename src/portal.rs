//! Human handoff portal.
//!
//! The only place a task's loop suspends waiting for a person. The loop
//! records an intervention, then blocks in [`InterventionPortal::wait_until_finished`]
//! until someone on another thread calls [`HandoffPortal::mark_finished`] or
//! the timeout runs out.
//!
//! One mutex guards the active request together with its completion signal;
//! the condition variable releases that mutex while the loop is parked, so
//! status readers and the resume call never block behind a waiting task.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::display::ConnectionInfo;
use crate::model::{InterventionRequest, NotificationEvent, NotificationLevel, event_kind};

/// An intervention that is waiting on a human right now.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveIntervention {
    pub request: InterventionRequest,
    pub started_at: DateTime<Utc>,
    pub connection_info: Option<ConnectionInfo>,
}

/// Capability set the orchestrator needs from a handoff portal.
pub trait InterventionPortal: Send + Sync {
    fn start(&self) {}

    /// Release any waiter and forget the current intervention.
    fn stop(&self);

    fn update_connection_info(&self, info: Option<ConnectionInfo>);

    /// Record `request` as the active intervention and describe how the
    /// human can reach it.
    fn request_intervention(&self, request: InterventionRequest) -> NotificationEvent;

    /// Block until the human signals completion (`true`) or `timeout`
    /// elapses (`false`). `None` waits indefinitely. Returns `false` at once
    /// when nothing is active.
    fn wait_until_finished(&self, timeout: Option<Duration>) -> bool;
}

/// Called whenever the active intervention appears or disappears.
pub type ChangeCallback = Box<dyn Fn(Option<&ActiveIntervention>) + Send + Sync>;

#[derive(Debug, Default)]
struct PortalState {
    current: Option<ActiveIntervention>,
    connection_info: Option<ConnectionInfo>,
    /// A completion signal exists for the current intervention.
    armed: bool,
    /// The signal has been set.
    finished: bool,
    /// Bumped whenever the signal is re-armed or torn down, so a waiter can
    /// tell its own intervention apart from a later one.
    generation: u64,
}

/// In-process portal used by the task supervisor.
pub struct HandoffPortal {
    state: Mutex<PortalState>,
    signal: Condvar,
    on_change: Option<ChangeCallback>,
}

impl Default for HandoffPortal {
    fn default() -> Self {
        Self::new()
    }
}

impl HandoffPortal {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PortalState::default()),
            signal: Condvar::new(),
            on_change: None,
        }
    }

    pub fn with_change_callback(callback: ChangeCallback) -> Self {
        Self {
            on_change: Some(callback),
            ..Self::new()
        }
    }

    fn state(&self) -> MutexGuard<'_, PortalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Invoke the change callback with no lock held.
    fn emit_change(&self) {
        let Some(callback) = &self.on_change else {
            return;
        };
        let current = self.state().current.clone();
        callback(current.as_ref());
    }

    pub fn get_active(&self) -> Option<ActiveIntervention> {
        self.state().current.clone()
    }

    /// Signal that the human is done. Idempotent; a no-op when nothing is
    /// armed.
    pub fn mark_finished(&self) {
        let mut state = self.state();
        if state.armed && !state.finished {
            state.finished = true;
            info!("intervention marked finished");
            self.signal.notify_all();
        }
    }
}

impl InterventionPortal for HandoffPortal {
    fn stop(&self) {
        let had_current = {
            let mut state = self.state();
            let had_current = state.current.is_some();
            state.current = None;
            state.armed = false;
            state.finished = false;
            state.generation += 1;
            self.signal.notify_all();
            had_current
        };
        if had_current {
            self.emit_change();
        }
    }

    fn update_connection_info(&self, info: Option<ConnectionInfo>) {
        let changed = {
            let mut state = self.state();
            state.connection_info = info.clone();
            match state.current.as_mut() {
                Some(current) => {
                    current.connection_info = info;
                    true
                }
                None => false,
            }
        };
        if changed {
            self.emit_change();
        }
    }

    fn request_intervention(&self, request: InterventionRequest) -> NotificationEvent {
        let connection_info = {
            let mut state = self.state();
            let connection_info = state.connection_info.clone();
            state.current = Some(ActiveIntervention {
                request: request.clone(),
                started_at: Utc::now(),
                connection_info: connection_info.clone(),
            });
            state.armed = true;
            state.finished = false;
            state.generation += 1;
            connection_info
        };
        info!(reason = %request.reason, source = ?request.source(), "intervention requested");
        self.emit_change();

        let metadata = request
            .metadata
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect::<serde_json::Map<_, _>>();
        let mut event = NotificationEvent::new(
            event_kind::USER_ACTION_REQUIRED,
            request.reason.clone(),
            NotificationLevel::Warning,
        )
        .with_data("reason", request.reason)
        .with_data("instructions", request.instructions)
        .with_data("metadata", Value::Object(metadata));
        if let Some(info) = connection_info {
            event = event.with_data("connection", Value::Object(info.to_fields()));
        }
        event
    }

    fn wait_until_finished(&self, timeout: Option<Duration>) -> bool {
        let state = self.state();
        if !state.armed {
            debug!("wait requested with no active intervention");
            return false;
        }
        let generation = state.generation;
        let pending = |s: &mut PortalState| s.generation == generation && !s.finished;

        let mut state = match timeout {
            Some(limit) => {
                let (state, result) = self
                    .signal
                    .wait_timeout_while(state, limit, pending)
                    .unwrap_or_else(PoisonError::into_inner);
                if result.timed_out() && state.generation == generation && !state.finished {
                    debug!(?limit, "intervention wait timed out");
                    return false;
                }
                state
            }
            None => self
                .signal
                .wait_while(state, pending)
                .unwrap_or_else(PoisonError::into_inner),
        };

        // Torn down by `stop` or superseded by a newer request: released, but
        // the state now belongs to someone else.
        if state.generation != generation {
            return true;
        }
        state.current = None;
        state.armed = false;
        state.finished = false;
        drop(state);
        self.emit_change();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    fn connection() -> ConnectionInfo {
        ConnectionInfo {
            host: "127.0.0.1".to_string(),
            port: 5900,
            display: ":99".to_string(),
        }
    }

    #[test]
    fn wait_without_active_intervention_returns_immediately() {
        let portal = HandoffPortal::new();
        let start = Instant::now();
        assert!(!portal.wait_until_finished(None));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn timeout_leaves_intervention_active() {
        let portal = HandoffPortal::new();
        portal.request_intervention(InterventionRequest::new("captcha", "solve it"));

        assert!(!portal.wait_until_finished(Some(Duration::from_millis(30))));
        let active = portal.get_active().unwrap();
        assert_eq!(active.request.reason, "captcha");
    }

    #[test]
    fn mark_finished_from_another_thread_releases_waiter() {
        let portal = Arc::new(HandoffPortal::new());
        portal.request_intervention(InterventionRequest::new("captcha", "solve it"));

        let resumer = {
            let portal = Arc::clone(&portal);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                portal.mark_finished();
                portal.mark_finished();
            })
        };

        assert!(portal.wait_until_finished(Some(Duration::from_secs(5))));
        resumer.join().unwrap();
        assert!(portal.get_active().is_none());
    }

    #[test]
    fn finish_before_wait_is_not_lost() {
        let portal = HandoffPortal::new();
        portal.request_intervention(InterventionRequest::new("captcha", "solve it"));
        portal.mark_finished();
        assert!(portal.wait_until_finished(Some(Duration::from_millis(10))));
        assert!(!portal.wait_until_finished(Some(Duration::from_millis(10))));
    }

    #[test]
    fn stop_releases_waiter_and_clears_state() {
        let portal = Arc::new(HandoffPortal::new());
        portal.request_intervention(InterventionRequest::new("captcha", "solve it"));

        let waiter = {
            let portal = Arc::clone(&portal);
            thread::spawn(move || portal.wait_until_finished(None))
        };
        thread::sleep(Duration::from_millis(20));
        portal.stop();

        assert!(waiter.join().unwrap());
        assert!(portal.get_active().is_none());
    }

    #[test]
    fn change_callback_sees_request_then_clear() {
        let seen: Arc<Mutex<Vec<Option<String>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let portal = HandoffPortal::with_change_callback(Box::new(move |active| {
            sink.lock()
                .unwrap()
                .push(active.map(|a| a.request.reason.clone()));
        }));

        portal.request_intervention(InterventionRequest::new("captcha", "solve it"));
        portal.mark_finished();
        assert!(portal.wait_until_finished(None));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![Some("captcha".to_string()), None]
        );
    }

    #[test]
    fn event_carries_instructions_and_connection() {
        let portal = HandoffPortal::new();
        portal.update_connection_info(Some(connection()));
        let event = portal.request_intervention(
            InterventionRequest::new("captcha", "solve it").with_default_source("llm_wait"),
        );

        assert_eq!(event.kind, event_kind::USER_ACTION_REQUIRED);
        assert_eq!(event.level, NotificationLevel::Warning);
        assert_eq!(event.data["reason"], "captcha");
        assert_eq!(event.data["instructions"], "solve it");
        assert_eq!(event.data["metadata"]["source"], "llm_wait");
        assert_eq!(event.data["connection"]["port"], 5900);
        assert_eq!(
            portal.get_active().unwrap().connection_info,
            Some(connection())
        );
    }

    #[test]
    fn update_connection_info_attaches_to_current_request() {
        let portal = HandoffPortal::new();
        portal.request_intervention(InterventionRequest::new("captcha", "solve it"));
        assert!(portal.get_active().unwrap().connection_info.is_none());

        portal.update_connection_info(Some(connection()));
        assert_eq!(
            portal.get_active().unwrap().connection_info,
            Some(connection())
        );
    }
}
