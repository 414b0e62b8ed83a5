//! The plan/act loop for one task.
//!
//! Each iteration either hands control to a human (a pending manual pause
//! always wins) or asks the planner for the next [`Directive`], writes its
//! notes, runs its actions in order, honours any requested delay, and then
//! dispatches on the directive's status:
//!
//! ```text
//! STARTING → LOOPING ⇄ {HANDLING_PAUSE | HANDLING_WAIT}
//!               └────→ {FINISHED | FAILED}      (ERROR from anywhere)
//! ```
//!
//! Faults never escape [`Orchestrator::run`]: they are reported as an
//! `orchestrator_error` notification and the run returns `false`. On every
//! exit path the environment, the remote display, and the portal are stopped,
//! in that order.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::TaskConfig;
use crate::control::ManualPauseController;
use crate::display::{ConnectionInfo, RemoteDisplay};
use crate::environment::{EnvState, Environment};
use crate::model::{
    Directive, DirectiveStatus, InterventionRequest, Note, NotificationEvent, NotificationLevel,
    SOURCE_LLM_WAIT, SOURCE_MANUAL_PAUSE, event_kind,
};
use crate::notes::NoteStore;
use crate::notify::Notifier;
use crate::planner::{ConversationTurn, Planner, PlannerContext, TurnRole};
use crate::portal::InterventionPortal;
use crate::prompt::PromptBuilder;

/// Most recent conversation turns kept for the planner.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

const USER_CONFIRMED: &str = "User confirmed manual step completed.";

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("planner requested user assistance but no intervention portal is configured")]
    PortalNotConfigured,
    #[error("timed out waiting for the user to finish the manual step")]
    InterventionTimedOut,
    #[error("planner failed: {0:#}")]
    Planner(anyhow::Error),
    #[error("environment failed: {0:#}")]
    Environment(anyhow::Error),
    #[error("note store failed: {0:#}")]
    Notes(anyhow::Error),
    #[error("remote display failed: {0:#}")]
    Display(anyhow::Error),
    #[error("orchestrator panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPhase {
    Starting,
    Looping,
    HandlingPause,
    HandlingWait,
    Finished,
    Failed,
    Error,
}

impl LoopPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Looping => "looping",
            Self::HandlingPause => "handling_pause",
            Self::HandlingWait => "handling_wait",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Error => "error",
        }
    }
}

pub struct Orchestrator {
    task: TaskConfig,
    planner: Box<dyn Planner>,
    environment: Box<dyn Environment>,
    notes: Box<dyn NoteStore>,
    notifier: Box<dyn Notifier>,
    portal: Option<Arc<dyn InterventionPortal>>,
    pause_controller: Option<Arc<ManualPauseController>>,
    display: Option<Box<dyn RemoteDisplay>>,
    wait_timeout: Option<Duration>,
    history_limit: usize,
    history: Vec<ConversationTurn>,
    state: EnvState,
    connection: Option<ConnectionInfo>,
    phase: LoopPhase,
}

impl Orchestrator {
    pub fn new(
        task: TaskConfig,
        planner: Box<dyn Planner>,
        environment: Box<dyn Environment>,
        notes: Box<dyn NoteStore>,
        notifier: Box<dyn Notifier>,
    ) -> Self {
        let history = planner.start_conversation();
        Self {
            task,
            planner,
            environment,
            notes,
            notifier,
            portal: None,
            pause_controller: None,
            display: None,
            wait_timeout: None,
            history_limit: DEFAULT_HISTORY_LIMIT,
            history,
            state: EnvState::default(),
            connection: None,
            phase: LoopPhase::Starting,
        }
    }

    pub fn with_portal(mut self, portal: Arc<dyn InterventionPortal>) -> Self {
        self.portal = Some(portal);
        self
    }

    pub fn with_pause_controller(mut self, controller: Arc<ManualPauseController>) -> Self {
        self.pause_controller = Some(controller);
        self
    }

    pub fn with_display(mut self, display: Box<dyn RemoteDisplay>) -> Self {
        self.display = Some(display);
        self
    }

    /// `None` waits for the human indefinitely.
    pub fn with_wait_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self.trim_history();
        self
    }

    pub fn phase(&self) -> LoopPhase {
        self.phase
    }

    pub fn history(&self) -> &[ConversationTurn] {
        &self.history
    }

    /// Drive the task to completion. Returns `true` only when the planner
    /// declared the task finished.
    pub fn run(&mut self) -> bool {
        info!(task = %self.task.description, "orchestrator starting");
        self.set_phase(LoopPhase::Starting);
        self.notify(
            NotificationEvent::new(
                event_kind::TASK_STARTED,
                format!("Starting task: {}", self.task.description),
                NotificationLevel::Info,
            )
            .with_data("description", self.task.description.clone()),
        );
        if let Some(portal) = &self.portal {
            portal.start();
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.drive()))
            .unwrap_or_else(|payload| Err(OrchestratorError::Panicked(panic_message(&*payload))));

        let succeeded = match outcome {
            Ok(succeeded) => succeeded,
            Err(e) => {
                self.set_phase(LoopPhase::Error);
                error!(error = %e, "orchestrator loop failed");
                let message = e.to_string();
                self.notify(
                    NotificationEvent::new(
                        event_kind::ORCHESTRATOR_ERROR,
                        message.clone(),
                        NotificationLevel::Error,
                    )
                    .with_data("error", message),
                );
                false
            }
        };

        self.shutdown();
        succeeded
    }

    fn drive(&mut self) -> Result<bool, OrchestratorError> {
        self.environment
            .start()
            .map_err(OrchestratorError::Environment)?;
        self.start_display()?;
        self.refresh_state()?;
        self.set_phase(LoopPhase::Looping);

        loop {
            if let Some(pause) = self
                .pause_controller
                .as_ref()
                .and_then(|controller| controller.consume_pending())
            {
                self.set_phase(LoopPhase::HandlingPause);
                info!(reason = %pause.request.reason, "manual pause taking over");
                let request = pause.request.with_default_source(SOURCE_MANUAL_PAUSE);
                let handled = self.handle_intervention(request);
                if let Some(controller) = &self.pause_controller {
                    controller.clear_active();
                }
                handled?;
                self.set_phase(LoopPhase::Looping);
                continue;
            }

            let directive = self.plan()?;

            for content in &directive.memory_to_write {
                self.notes
                    .add(Note::new(content.clone()))
                    .map_err(OrchestratorError::Notes)?;
            }

            for action in &directive.actions {
                debug!(kind = %action.kind, "executing action");
                self.state = self
                    .environment
                    .execute(action)
                    .map_err(OrchestratorError::Environment)?;
            }

            if let Some(delay) = directive.wait_duration() {
                debug!(?delay, "planner requested a delay");
                thread::sleep(delay);
            }

            match directive.status {
                DirectiveStatus::Continue | DirectiveStatus::Wait => {}
                DirectiveStatus::WaitForUser => {
                    self.set_phase(LoopPhase::HandlingWait);
                    let request = directive
                        .user_request
                        .unwrap_or_else(|| default_request(&self.task.description))
                        .with_default_source(SOURCE_LLM_WAIT);
                    self.handle_intervention(request)?;
                    self.set_phase(LoopPhase::Looping);
                }
                DirectiveStatus::Finished => {
                    self.finish(directive.message);
                    return Ok(true);
                }
                DirectiveStatus::Failed => {
                    self.fail(directive.failure_reason);
                    return Ok(false);
                }
            }
        }
    }

    fn plan(&mut self) -> Result<Directive, OrchestratorError> {
        let notes = self.notes.entries().map_err(OrchestratorError::Notes)?;
        let prompt = PromptBuilder::new(&self.task.description, self.task.goal.as_deref())
            .render(&self.state, &notes, &self.history);
        self.push_turn(TurnRole::User, prompt.clone());

        let context = PlannerContext {
            task_description: &self.task.description,
            goal: self.task.goal.as_deref(),
            state: &self.state,
            notes: &notes,
            history: &self.history,
        };
        let directive = self
            .planner
            .complete(&prompt, &context)
            .map_err(OrchestratorError::Planner)?;
        debug!(
            status = directive.status.as_str(),
            actions = directive.actions.len(),
            "planner returned directive"
        );

        let summary = directive
            .message
            .clone()
            .unwrap_or_else(|| directive.status.as_str().to_string());
        self.push_turn(TurnRole::Assistant, summary);

        if let Some(message) = &directive.message {
            self.notify(
                NotificationEvent::new(
                    event_kind::LLM_STEP,
                    message.clone(),
                    NotificationLevel::Info,
                )
                .with_data("status", directive.status.as_str())
                .with_data("actions", directive.actions.len()),
            );
        }
        Ok(directive)
    }

    fn handle_intervention(
        &mut self,
        request: InterventionRequest,
    ) -> Result<(), OrchestratorError> {
        let portal = self
            .portal
            .clone()
            .ok_or(OrchestratorError::PortalNotConfigured)?;

        let event = portal.request_intervention(request);
        self.notify(event);

        if !portal.wait_until_finished(self.wait_timeout) {
            return Err(OrchestratorError::InterventionTimedOut);
        }
        info!("user finished manual step; resuming");
        self.push_turn(TurnRole::System, USER_CONFIRMED);
        self.refresh_state()
    }

    fn start_display(&mut self) -> Result<(), OrchestratorError> {
        let info = match self.display.as_mut() {
            Some(display) => display.start().map_err(OrchestratorError::Display)?,
            None => return Ok(()),
        };
        let Some(info) = info else {
            return Ok(());
        };

        self.notify(
            NotificationEvent::new(
                event_kind::VNC_READY,
                format!("Remote display ready at {}:{}", info.host, info.port),
                NotificationLevel::Info,
            )
            .with_fields(info.to_fields()),
        );
        if let Some(portal) = &self.portal {
            portal.update_connection_info(Some(info.clone()));
        }
        self.connection = Some(info);
        Ok(())
    }

    fn finish(&mut self, message: Option<String>) {
        self.set_phase(LoopPhase::Finished);
        let message = message.unwrap_or_else(|| "Task finished".to_string());
        info!(%message, "task finished");
        self.notify(NotificationEvent::new(
            event_kind::TASK_FINISHED,
            message,
            NotificationLevel::Success,
        ));
        if let Some(info) = &self.connection {
            self.notify(
                NotificationEvent::new(
                    event_kind::TASK_READY_FOR_REVIEW,
                    "Task finished; the remote display is available for review",
                    NotificationLevel::Info,
                )
                .with_fields(info.to_fields()),
            );
        }
    }

    fn fail(&mut self, reason: Option<String>) {
        self.set_phase(LoopPhase::Failed);
        let reason = reason.unwrap_or_else(|| "Task failed".to_string());
        warn!(%reason, "planner declared failure");
        self.notify(
            NotificationEvent::new(
                event_kind::TASK_FAILED,
                reason.clone(),
                NotificationLevel::Error,
            )
            .with_data("reason", reason),
        );
    }

    fn shutdown(&mut self) {
        if let Err(e) = self.environment.stop() {
            warn!(error = %e, "failed to stop environment");
        }
        if let Some(display) = self.display.as_mut()
            && let Err(e) = display.stop()
        {
            warn!(error = %e, "failed to stop remote display");
        }
        if let Some(portal) = &self.portal {
            portal.stop();
        }
        debug!(phase = self.phase.as_str(), "orchestrator shut down");
    }

    fn refresh_state(&mut self) -> Result<(), OrchestratorError> {
        self.state = self
            .environment
            .snapshot()
            .map_err(OrchestratorError::Environment)?;
        Ok(())
    }

    fn push_turn(&mut self, role: TurnRole, content: impl Into<String>) {
        self.history.push(ConversationTurn::new(role, content));
        self.trim_history();
    }

    fn trim_history(&mut self) {
        if self.history.len() > self.history_limit {
            let excess = self.history.len() - self.history_limit;
            self.history.drain(..excess);
        }
    }

    fn set_phase(&mut self, phase: LoopPhase) {
        if self.phase != phase {
            debug!(from = self.phase.as_str(), to = phase.as_str(), "orchestrator phase");
            self.phase = phase;
        }
    }

    fn notify(&self, event: NotificationEvent) {
        self.notifier.notify(&event);
    }
}

fn default_request(description: &str) -> InterventionRequest {
    InterventionRequest::new(
        format!("Assistance needed while working on: {description}"),
        "Please resolve the blocking step and click 'Finished'.",
    )
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
