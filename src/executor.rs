//! Host-facing registry of task runners.
//!
//! Keeps every task created in this process, in creation order, and routes
//! operator commands to the right [`TaskRunner`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Context;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::config::{self, RunnerConfig};
use crate::factory::CollaboratorFactory;
use crate::runner::{ArtifactError, Task, TaskRunner, TaskStatus};

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("task not found: {0}")]
    TaskNotFound(String),
    #[error("a pause is already pending for task {0}")]
    PauseConflict(String),
    #[error("task {0} has no active intervention to resume")]
    NothingToResume(String),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error("{0:#}")]
    Internal(anyhow::Error),
}

pub type ExecutorResult<T> = std::result::Result<T, ExecutorError>;

/// Task counts by status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
    /// Names of the active executor-side overrides; values are not exposed.
    pub env_overrides: Vec<String>,
}

type Registry = Vec<(String, Arc<TaskRunner>)>;

pub struct ExecutorService {
    artifact_root: PathBuf,
    factory: Arc<dyn CollaboratorFactory>,
    tasks: Mutex<Registry>,
    env_overrides: Mutex<BTreeMap<String, String>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ExecutorService {
    pub fn new(
        artifact_root: impl Into<PathBuf>,
        factory: Arc<dyn CollaboratorFactory>,
    ) -> ExecutorResult<Self> {
        let artifact_root = artifact_root.into();
        std::fs::create_dir_all(&artifact_root)
            .with_context(|| {
                format!(
                    "failed to create artifact root {}",
                    artifact_root.display()
                )
            })
            .map_err(ExecutorError::Internal)?;
        Ok(Self {
            artifact_root,
            factory,
            tasks: Mutex::new(Vec::new()),
            env_overrides: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn artifact_root(&self) -> &Path {
        &self.artifact_root
    }

    /// Register a task and start its worker. Executor overrides are applied
    /// on top of `config`.
    pub fn create_task(&self, config: RunnerConfig) -> ExecutorResult<String> {
        let overrides = config::env_overrides(self.env_overrides());
        let config = config
            .merged_with(&overrides)
            .map_err(ExecutorError::Internal)?;
        let runner = Arc::new(
            TaskRunner::new(config, &self.artifact_root, Arc::clone(&self.factory))
                .map_err(ExecutorError::Internal)?,
        );
        self.launch(runner, TaskRunner::start)
    }

    /// Start `runner` and register it only once it is running, so a failed
    /// launch never leaves a PENDING task in the registry.
    fn launch<F>(&self, runner: Arc<TaskRunner>, start: F) -> ExecutorResult<String>
    where
        F: FnOnce(&TaskRunner) -> anyhow::Result<()>,
    {
        let id = runner.task_id();
        start(runner.as_ref()).map_err(ExecutorError::Internal)?;
        lock(&self.tasks).push((id.clone(), runner));
        info!(task_id = %id, "task created");
        Ok(id)
    }

    pub fn runner(&self, id: &str) -> ExecutorResult<Arc<TaskRunner>> {
        lock(&self.tasks)
            .iter()
            .find(|(task_id, _)| task_id == id)
            .map(|(_, runner)| Arc::clone(runner))
            .ok_or_else(|| ExecutorError::TaskNotFound(id.to_string()))
    }

    /// Snapshots of every task, oldest first.
    pub fn list_tasks(&self) -> Vec<Task> {
        let runners: Vec<Arc<TaskRunner>> = lock(&self.tasks)
            .iter()
            .map(|(_, runner)| Arc::clone(runner))
            .collect();
        runners.iter().map(|runner| runner.snapshot()).collect()
    }

    pub fn task(&self, id: &str) -> ExecutorResult<Task> {
        Ok(self.runner(id)?.snapshot())
    }

    pub fn pause(&self, id: &str, reason: &str, instructions: &str) -> ExecutorResult<()> {
        if self.runner(id)?.request_pause(reason, instructions) {
            Ok(())
        } else {
            Err(ExecutorError::PauseConflict(id.to_string()))
        }
    }

    pub fn resume(&self, id: &str) -> ExecutorResult<()> {
        if self.runner(id)?.resume() {
            Ok(())
        } else {
            Err(ExecutorError::NothingToResume(id.to_string()))
        }
    }

    /// Block until the task's worker exits; `true` when it completed.
    pub fn join(&self, id: &str) -> ExecutorResult<bool> {
        let runner = self.runner(id)?;
        Ok(match runner.join() {
            Some(succeeded) => succeeded,
            None => runner.snapshot().status == TaskStatus::Completed,
        })
    }

    pub fn list_artifacts(&self, id: &str) -> ExecutorResult<Vec<String>> {
        self.runner(id)?
            .list_artifacts()
            .map_err(ExecutorError::Internal)
    }

    pub fn artifact_path(&self, id: &str, name: &str) -> ExecutorResult<PathBuf> {
        Ok(self.runner(id)?.artifact_path(name)?)
    }

    /// Replace the overrides applied to tasks created from now on.
    pub fn set_env_overrides(&self, overrides: BTreeMap<String, String>) {
        info!(count = overrides.len(), "executor overrides updated");
        *lock(&self.env_overrides) = overrides;
    }

    pub fn env_overrides(&self) -> BTreeMap<String, String> {
        lock(&self.env_overrides).clone()
    }

    pub fn health(&self) -> HealthReport {
        let tasks = self.list_tasks();
        let mut by_status: BTreeMap<String, usize> = TaskStatus::ALL
            .iter()
            .map(|status| (status.as_str().to_string(), 0))
            .collect();
        for task in &tasks {
            *by_status.entry(task.status.as_str().to_string()).or_default() += 1;
        }
        HealthReport {
            total: tasks.len(),
            by_status,
            env_overrides: lock(&self.env_overrides).keys().cloned().collect(),
        }
    }
}
