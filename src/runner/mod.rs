//! Per-task supervisor.
//!
//! A [`TaskRunner`] owns one [`Task`] record and runs exactly one
//! orchestrator for it on a dedicated worker thread. The worker, the
//! recorder callbacks, and the portal's change callback are the only writers;
//! everyone else reads deep copies through [`TaskRunner::snapshot`]. The task
//! lock is held only for field updates, never across a blocking call.

mod model;

pub use model::{ActionRecord, Task, TaskStatus, intervention_status};

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::RunnerConfig;
use crate::control::ManualPauseController;
use crate::display::ConnectionInfo;
use crate::environment::EnvState;
use crate::factory::CollaboratorFactory;
use crate::instrument::{
    InstrumentedEnvironment, InstrumentedNoteStore, InstrumentedNotifier, Recorder,
};
use crate::model::{Action, Note, NotificationEvent};
use crate::orchestrator::{Orchestrator, panic_message};
use crate::portal::HandoffPortal;

const TASK_REPORTED_FAILURE: &str = "task reported failure";

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact name must not be empty")]
    Empty,
    #[error("artifact name must be relative: {0}")]
    Absolute(String),
    #[error("artifact name escapes the task's artifact directory: {0}")]
    EscapesDirectory(String),
    #[error("artifact not found: {0}")]
    NotFound(String),
}

fn lock_task(task: &Mutex<Task>) -> MutexGuard<'_, Task> {
    task.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Receives side effects from the instrumented collaborators and folds them
/// into the task record.
pub struct TaskRecorder {
    task: Arc<Mutex<Task>>,
    artifact_dir: PathBuf,
    next_index: AtomicUsize,
}

impl TaskRecorder {
    fn new(task: Arc<Mutex<Task>>, artifact_dir: PathBuf) -> Self {
        Self {
            task,
            artifact_dir,
            next_index: AtomicUsize::new(0),
        }
    }

    fn write_artifact(&self, index: usize, bytes: &[u8]) -> Option<String> {
        let name = format!("step_{index:04}.png");
        let path = self.artifact_dir.join(&name);
        let written = std::fs::create_dir_all(&self.artifact_dir)
            .with_context(|| format!("failed to create {}", self.artifact_dir.display()))
            .and_then(|()| {
                std::fs::write(&path, bytes)
                    .with_context(|| format!("failed to write {}", path.display()))
            });
        match written {
            Ok(()) => Some(name),
            Err(e) => {
                let message = format!("{e:#}");
                warn!(error = %message, "failed to save artifact");
                None
            }
        }
    }
}

impl Recorder for TaskRecorder {
    fn on_action(&self, action: &Action, state: &EnvState, screenshot: Option<&[u8]>) {
        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        let artifact = screenshot
            .filter(|bytes| !bytes.is_empty())
            .and_then(|bytes| self.write_artifact(index, bytes));
        lock_task(&self.task).actions.push(ActionRecord {
            index,
            action: action.clone(),
            resulting_state: state.clone(),
            artifact,
            timestamp: Utc::now(),
        });
    }

    fn on_memory(&self, note: &Note) {
        lock_task(&self.task).notes.push(note.clone());
    }

    fn on_notification(&self, event: &NotificationEvent) {
        let connection = ConnectionInfo::from_fields(&event.data).or_else(|| {
            event
                .data
                .get("connection")
                .and_then(Value::as_object)
                .and_then(ConnectionInfo::from_fields)
        });
        let mut task = lock_task(&self.task);
        task.logs.push(event.clone());
        if connection.is_some() {
            task.connection_info = connection;
        }
    }
}

struct RunnerShared {
    task: Arc<Mutex<Task>>,
    config: RunnerConfig,
    factory: Arc<dyn CollaboratorFactory>,
    recorder: Arc<TaskRecorder>,
    controller: Arc<ManualPauseController>,
    portal: Arc<HandoffPortal>,
    artifact_dir: PathBuf,
    /// Set once the task has been handed to a worker or run inline.
    launched: AtomicBool,
}

impl RunnerShared {
    /// `true` for the first caller only.
    fn claim_launch(&self) -> bool {
        let first = !self.launched.swap(true, Ordering::SeqCst);
        if !first {
            debug!(task_id = %self.task_id(), "task already launched; ignoring");
        }
        first
    }

    fn task_id(&self) -> String {
        lock_task(&self.task).id.clone()
    }

    fn build_orchestrator(&self) -> Result<Orchestrator> {
        let task_id = self.task_id();
        let recorder: Arc<dyn Recorder> = self.recorder.clone();
        let config = &self.config;

        let planner = self.factory.planner(config).context("failed to build planner")?;
        let environment = InstrumentedEnvironment::new(
            self.factory
                .environment(config)
                .context("failed to build environment")?,
            Arc::clone(&recorder),
            config.capture_artifacts,
        );
        let notes = InstrumentedNoteStore::new(
            self.factory.notes(config).context("failed to build note store")?,
            Arc::clone(&recorder),
        );
        let notifier = InstrumentedNotifier::new(
            self.factory
                .notifier(config, &task_id)
                .context("failed to build notifier")?,
            recorder,
        );

        let mut orchestrator = Orchestrator::new(
            config.task.clone(),
            planner,
            Box::new(environment),
            Box::new(notes),
            Box::new(notifier),
        )
        .with_portal(self.portal.clone())
        .with_pause_controller(Arc::clone(&self.controller))
        .with_wait_timeout(config.wait_timeout())
        .with_history_limit(config.history_limit);

        if let Some(display) = self
            .factory
            .display(config)
            .context("failed to build remote display")?
        {
            orchestrator = orchestrator.with_display(display);
        }
        Ok(orchestrator)
    }

    /// Worker body. Every path ends with the task in a terminal status.
    fn execute(&self) -> bool {
        let task_id = {
            let mut task = lock_task(&self.task);
            task.status = TaskStatus::Running;
            task.started_at = Some(Utc::now());
            task.id.clone()
        };
        info!(task_id = %task_id, "task started");

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.build_orchestrator().map(|mut orchestrator| orchestrator.run())
        }));
        let (succeeded, fault) = match outcome {
            Ok(Ok(succeeded)) => (succeeded, None),
            Ok(Err(e)) => (false, Some(format!("{e:#}"))),
            Err(payload) => (false, Some(panic_message(&*payload))),
        };

        let mut task = lock_task(&self.task);
        task.finished_at = Some(Utc::now());
        task.current_request = None;
        if succeeded {
            task.status = TaskStatus::Completed;
            info!(task_id = %task_id, "task completed");
        } else {
            task.status = TaskStatus::Failed;
            let message = fault
                .or_else(|| task.last_error_message().map(str::to_string))
                .unwrap_or_else(|| TASK_REPORTED_FAILURE.to_string());
            error!(task_id = %task_id, error = %message, "task failed");
            task.error = Some(message);
        }
        succeeded
    }
}

pub struct TaskRunner {
    shared: Arc<RunnerShared>,
    handle: Mutex<Option<JoinHandle<bool>>>,
}

impl TaskRunner {
    /// Create a PENDING task whose artifacts live under
    /// `<artifact_root>/<task_id>/`.
    pub fn new(
        config: RunnerConfig,
        artifact_root: &Path,
        factory: Arc<dyn CollaboratorFactory>,
    ) -> Result<Self> {
        config.validate()?;
        let id = Uuid::new_v4().simple().to_string();
        let artifact_dir = artifact_root.join(&id);
        std::fs::create_dir_all(&artifact_dir).with_context(|| {
            format!(
                "failed to create artifact directory {}",
                artifact_dir.display()
            )
        })?;

        let task = Arc::new(Mutex::new(Task::new(id, &config)));
        let recorder = Arc::new(TaskRecorder::new(Arc::clone(&task), artifact_dir.clone()));

        let portal_task = Arc::clone(&task);
        let portal = Arc::new(HandoffPortal::with_change_callback(Box::new(move |active| {
            let mut task = lock_task(&portal_task);
            let next = intervention_status(task.status, active.map(|a| &a.request));
            if next != task.status {
                info!(task_id = %task.id, from = %task.status, to = %next, "task status changed");
            }
            task.status = next;
            task.current_request = active.cloned();
            if let Some(info) = active.and_then(|a| a.connection_info.clone()) {
                task.connection_info = Some(info);
            }
        })));

        Ok(Self {
            shared: Arc::new(RunnerShared {
                task,
                config,
                factory,
                recorder,
                controller: Arc::new(ManualPauseController::new()),
                portal,
                artifact_dir,
                launched: AtomicBool::new(false),
            }),
            handle: Mutex::new(None),
        })
    }

    pub fn task_id(&self) -> String {
        self.shared.task_id()
    }

    pub fn artifact_dir(&self) -> &Path {
        &self.shared.artifact_dir
    }

    /// Launch the worker thread. A task runs at most once; later calls, and
    /// calls after [`TaskRunner::run_inline`], are no-ops.
    pub fn start(&self) -> Result<()> {
        let mut handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.shared.claim_launch() {
            return Ok(());
        }
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(format!("task-{}", shared.task_id()))
            .spawn(move || shared.execute());
        match spawned {
            Ok(spawned) => {
                *handle = Some(spawned);
                Ok(())
            }
            Err(e) => {
                self.shared.launched.store(false, Ordering::SeqCst);
                Err(e).context("failed to spawn task worker")
            }
        }
    }

    /// Run the task on the calling thread. Returns `false` without running
    /// anything if the task was already launched.
    pub fn run_inline(&self) -> bool {
        if !self.shared.claim_launch() {
            return false;
        }
        self.shared.execute()
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Wait for the worker and return whether the task completed.
    pub fn join(&self) -> Option<bool> {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        match handle.join() {
            Ok(succeeded) => Some(succeeded),
            Err(_) => Some(false),
        }
    }

    /// Ask the running loop to hand control to a human at its next
    /// iteration. `false` if a pause is already outstanding.
    pub fn request_pause(&self, reason: &str, instructions: &str) -> bool {
        self.request_pause_with(reason, instructions, None)
    }

    pub fn request_pause_with(
        &self,
        reason: &str,
        instructions: &str,
        metadata: Option<BTreeMap<String, Value>>,
    ) -> bool {
        let accepted = self
            .shared
            .controller
            .request_pause(reason, instructions, metadata);
        if accepted {
            info!(task_id = %self.task_id(), reason, "pause requested");
        }
        accepted
    }

    /// Release the active intervention. `false` if nothing is active.
    pub fn resume(&self) -> bool {
        if self.shared.portal.get_active().is_none() {
            debug!(task_id = %self.task_id(), "resume ignored: no active intervention");
            return false;
        }
        self.shared.portal.mark_finished();
        info!(task_id = %self.task_id(), "task resumed");
        true
    }

    /// Independent deep copy of the task record.
    pub fn snapshot(&self) -> Task {
        lock_task(&self.shared.task).clone()
    }

    /// Outstanding pause request, pending or being handled.
    pub fn pending_pause(&self) -> Option<crate::control::ManualPauseRequest> {
        self.shared.controller.snapshot()
    }

    /// Sorted artifact file names; empty when nothing was captured yet.
    pub fn list_artifacts(&self) -> Result<Vec<String>> {
        let dir = &self.shared.artifact_dir;
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        let entries =
            std::fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))?;
        for entry in entries {
            let entry = entry.with_context(|| format!("failed to read {}", dir.display()))?;
            if entry.file_type().map(|t| t.is_file()).unwrap_or(false)
                && let Some(name) = entry.file_name().to_str()
            {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Resolve `name` inside this task's artifact directory.
    pub fn artifact_path(&self, name: &str) -> Result<PathBuf, ArtifactError> {
        resolve_artifact(&self.shared.artifact_dir, name)
    }
}

/// Resolve a caller-supplied relative name against `base`, rejecting
/// anything that would land outside it.
///
/// The check is lexical first, so traversal is refused before touching the
/// filesystem; existing paths are then canonicalized to catch symlinks that
/// point outside.
pub fn resolve_artifact(base: &Path, name: &str) -> Result<PathBuf, ArtifactError> {
    if name.trim().is_empty() {
        return Err(ArtifactError::Empty);
    }
    let candidate = Path::new(name);
    if candidate.is_absolute() || candidate.has_root() {
        return Err(ArtifactError::Absolute(name.to_string()));
    }

    let mut depth: usize = 0;
    for component in candidate.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| ArtifactError::EscapesDirectory(name.to_string()))?;
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(ArtifactError::Absolute(name.to_string()));
            }
        }
    }
    if depth == 0 {
        return Err(ArtifactError::EscapesDirectory(name.to_string()));
    }

    let joined = base.join(candidate);
    let Ok(resolved) = joined.canonicalize() else {
        return Err(ArtifactError::NotFound(name.to_string()));
    };
    let base = base
        .canonicalize()
        .map_err(|_| ArtifactError::NotFound(name.to_string()))?;
    if !resolved.starts_with(&base) || resolved == base {
        return Err(ArtifactError::EscapesDirectory(name.to_string()));
    }
    Ok(resolved)
}
