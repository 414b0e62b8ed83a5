//! Structured event log: JSON lines per task.
//!
//! Each notification the loop emits becomes one self-contained JSON object
//! on its own line, stamped with the time it was written and, when known,
//! the task it belongs to. Logs are easy to grep, stream, and post-process.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::model::NotificationEvent;
use crate::notify::Notifier;

/// One line of the event log.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry<'a> {
    pub logged_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<&'a str>,
    #[serde(flatten)]
    pub event: &'a NotificationEvent,
}

/// Appends notifications to a `.jsonl` file.
pub struct JsonlNotifier {
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
    task_id: Option<String>,
}

impl JsonlNotifier {
    /// Open `path` for appending, creating it and its parent directories.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory: {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file: {}", path.display()))?;

        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
            path: path.to_path_buf(),
            task_id: None,
        })
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one event.
    pub fn log(&self, event: &NotificationEvent) -> Result<()> {
        let entry = LogEntry {
            logged_at: Utc::now(),
            task_id: self.task_id.as_deref(),
            event,
        };
        let json = serde_json::to_string(&entry).context("failed to serialize log entry")?;
        debug!(event = %json, "event log");

        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(writer, "{json}").context("failed to write log entry")?;
        writer.flush().context("failed to flush log")?;
        Ok(())
    }
}

impl Notifier for JsonlNotifier {
    fn notify(&self, event: &NotificationEvent) {
        if let Err(e) = self.log(event) {
            warn!(path = %self.path.display(), error = %e, "failed to append to event log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NotificationLevel, event_kind};

    fn event(kind: &str) -> NotificationEvent {
        NotificationEvent::new(kind, "msg", NotificationLevel::Info).with_data("step", 1)
    }

    #[test]
    fn write_and_read_log_file() {
        let tmp = tempfile::tempdir().unwrap();
        let log_path = tmp.path().join("events.jsonl");
        let log = JsonlNotifier::new(&log_path).unwrap().with_task_id("t-1");

        log.notify(&event(event_kind::TASK_STARTED));
        log.notify(&event(event_kind::LLM_STEP));
        log.notify(&event(event_kind::TASK_FINISHED));

        let content = std::fs::read_to_string(&log_path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        for line in &lines {
            let parsed: serde_json::Value = serde_json::from_str(line).unwrap();
            assert!(parsed.get("logged_at").is_some());
            assert_eq!(parsed["task_id"], "t-1");
            assert_eq!(parsed["data"]["step"], 1);
        }
        assert!(lines[0].contains("\"type\":\"task_started\""));
        assert!(lines[2].contains("\"type\":\"task_finished\""));
    }

    #[test]
    fn creates_parent_directories_and_appends() {
        let tmp = tempfile::tempdir().unwrap();
        let log_path = tmp.path().join("deep").join("nested").join("run.jsonl");

        JsonlNotifier::new(&log_path).unwrap().log(&event(event_kind::TASK_STARTED)).unwrap();
        let log = JsonlNotifier::new(&log_path).unwrap();
        log.log(&event(event_kind::TASK_FAILED)).unwrap();

        assert_eq!(log.path(), log_path);
        let content = std::fs::read_to_string(&log_path).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(!content.contains("task_id"));
    }
}
