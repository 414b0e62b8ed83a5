//! Externally visible task record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::RunnerConfig;
use crate::display::ConnectionInfo;
use crate::environment::EnvState;
use crate::model::{Action, InterventionRequest, Note, NotificationEvent};
use crate::portal::ActiveIntervention;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    WaitingForUser,
    Paused,
    Completed,
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        Self::Pending,
        Self::Running,
        Self::WaitingForUser,
        Self::Paused,
        Self::Completed,
        Self::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::WaitingForUser => "waiting_for_user",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status implied by the portal's active intervention.
///
/// Terminal statuses never change. An operator pause reads as `Paused`, any
/// other request as `WaitingForUser`; clearing the request returns a task
/// that was waiting to `Running`.
pub fn intervention_status(
    current: TaskStatus,
    active: Option<&InterventionRequest>,
) -> TaskStatus {
    if current.is_terminal() {
        return current;
    }
    match active {
        Some(request) if request.is_manual_pause() => TaskStatus::Paused,
        Some(_) => TaskStatus::WaitingForUser,
        None if matches!(current, TaskStatus::Paused | TaskStatus::WaitingForUser) => {
            TaskStatus::Running
        }
        None => current,
    }
}

/// One executed action, in execution order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub index: usize,
    pub action: Action,
    pub resulting_state: EnvState,
    /// Artifact file name inside the task's artifact directory.
    #[serde(default)]
    pub artifact: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub goal: Option<String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub logs: Vec<NotificationEvent>,
    pub actions: Vec<ActionRecord>,
    pub notes: Vec<Note>,
    pub current_request: Option<ActiveIntervention>,
    pub connection_info: Option<ConnectionInfo>,
    pub error: Option<String>,
}

impl Task {
    pub fn new(id: impl Into<String>, config: &RunnerConfig) -> Self {
        Self {
            id: id.into(),
            description: config.task.description.clone(),
            goal: config.task.goal.clone(),
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            logs: Vec::new(),
            actions: Vec::new(),
            notes: Vec::new(),
            current_request: None,
            connection_info: None,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Message of the most recent error-level notification.
    pub fn last_error_message(&self) -> Option<&str> {
        self.logs
            .iter()
            .rev()
            .find(|e| e.level == crate::model::NotificationLevel::Error)
            .map(|e| e.message.as_str())
    }
}
