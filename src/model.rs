//! Shared value types passed between the planner, the loop, and the task
//! supervisor.
//!
//! Nothing here has behavior beyond construction helpers; the planner and the
//! environment treat actions and metadata as opaque structured values.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Metadata key recording where an intervention request came from.
pub const SOURCE_KEY: &str = "source";
/// Intervention requested by an operator through the pause controller.
pub const SOURCE_MANUAL_PAUSE: &str = "manual_pause";
/// Intervention requested by the planner via `wait_for_user`.
pub const SOURCE_LLM_WAIT: &str = "llm_wait";

/// Notification types emitted by the orchestrator loop.
pub mod event_kind {
    pub const TASK_STARTED: &str = "task_started";
    pub const TASK_FINISHED: &str = "task_finished";
    pub const TASK_FAILED: &str = "task_failed";
    pub const TASK_READY_FOR_REVIEW: &str = "task_ready_for_review";
    pub const LLM_STEP: &str = "llm_step";
    pub const VNC_READY: &str = "vnc_ready";
    pub const USER_ACTION_REQUIRED: &str = "user_action_required";
    pub const ORCHESTRATOR_ERROR: &str = "orchestrator_error";
}

/// Status returned by the planner alongside each directive.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectiveStatus {
    #[default]
    Continue,
    Wait,
    WaitForUser,
    Finished,
    Failed,
}

impl DirectiveStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::Wait => "wait",
            Self::WaitForUser => "wait_for_user",
            Self::Finished => "finished",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }
}

/// One opaque instruction for the environment.
///
/// `kind` selects the operation; every other key is passed through verbatim.
/// Serialized flat, e.g. `{"type": "navigate", "url": "https://example.com"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl Action {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            params: Map::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }
}

/// Request for a human to take over the environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterventionRequest {
    pub reason: String,
    pub instructions: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    /// Informational only: the loop always waits for the human to return.
    #[serde(default)]
    pub allow_finish_without_return: bool,
}

impl InterventionRequest {
    pub fn new(reason: impl Into<String>, instructions: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            instructions: instructions.into(),
            metadata: BTreeMap::new(),
            allow_finish_without_return: false,
        }
    }

    /// The `source` metadata tag, when it is a string.
    pub fn source(&self) -> Option<&str> {
        self.metadata.get(SOURCE_KEY).and_then(Value::as_str)
    }

    /// Tag the request with `source` unless a source is already present.
    pub fn with_default_source(mut self, source: &str) -> Self {
        self.metadata
            .entry(SOURCE_KEY.to_string())
            .or_insert_with(|| Value::String(source.to_string()));
        self
    }

    pub fn is_manual_pause(&self) -> bool {
        self.source() == Some(SOURCE_MANUAL_PAUSE)
    }
}

/// Output of one planning step.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Directive {
    #[serde(default)]
    pub status: DirectiveStatus,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub wait_seconds: Option<f64>,
    #[serde(default)]
    pub user_request: Option<InterventionRequest>,
    #[serde(default)]
    pub memory_to_write: Vec<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

impl Directive {
    pub fn new(status: DirectiveStatus) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.memory_to_write.push(note.into());
        self
    }

    pub fn with_user_request(mut self, request: InterventionRequest) -> Self {
        self.user_request = Some(request);
        self
    }

    /// Scheduling delay requested by the planner. Zero, negative and
    /// non-finite values mean "no delay"; values too large for a `Duration`
    /// saturate.
    pub fn wait_duration(&self) -> Option<Duration> {
        match self.wait_seconds {
            Some(secs) if secs.is_finite() && secs > 0.0 => {
                Some(Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX))
            }
            _ => None,
        }
    }
}

/// A note persisted by the planner for later steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub importance: Option<f64>,
}

impl Note {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            created_at: Utc::now(),
            importance: None,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationLevel {
    #[default]
    Info,
    Warning,
    Error,
    Success,
}

impl NotificationLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Success => "success",
        }
    }
}

/// Event emitted to notification sinks and recorded in the task log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub level: NotificationLevel,
    #[serde(default)]
    pub data: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl NotificationEvent {
    pub fn new(kind: &str, message: impl Into<String>, level: NotificationLevel) -> Self {
        Self {
            kind: kind.to_string(),
            message: message.into(),
            level,
            data: Map::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn with_fields(mut self, fields: Map<String, Value>) -> Self {
        self.data.extend(fields);
        self
    }
}
