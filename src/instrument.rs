//! Collaborator wrappers that report side effects to a [`Recorder`].
//!
//! The orchestrator never talks to the recorder directly: the task runner
//! wraps the environment, note store, and notifier before handing them over,
//! so every executed action, written note, and emitted notification is
//! observed in the order it happened.

use std::sync::Arc;

use anyhow::Result;
use tracing::warn;

use crate::environment::{EnvState, Environment};
use crate::model::{Action, Note, NotificationEvent};
use crate::notes::NoteStore;
use crate::notify::Notifier;

/// Observer for a task's side effects.
pub trait Recorder: Send + Sync {
    fn on_action(&self, action: &Action, state: &EnvState, screenshot: Option<&[u8]>);
    fn on_memory(&self, note: &Note);
    fn on_notification(&self, event: &NotificationEvent);
}

pub struct InstrumentedEnvironment {
    inner: Box<dyn Environment>,
    recorder: Arc<dyn Recorder>,
    capture_screenshots: bool,
}

impl InstrumentedEnvironment {
    pub fn new(
        inner: Box<dyn Environment>,
        recorder: Arc<dyn Recorder>,
        capture_screenshots: bool,
    ) -> Self {
        Self {
            inner,
            recorder,
            capture_screenshots,
        }
    }
}

impl Environment for InstrumentedEnvironment {
    fn start(&mut self) -> Result<()> {
        self.inner.start()
    }

    fn stop(&mut self) -> Result<()> {
        self.inner.stop()
    }

    fn execute(&mut self, action: &Action) -> Result<EnvState> {
        let state = self.inner.execute(action)?;
        let screenshot = if self.capture_screenshots {
            self.inner.screenshot().unwrap_or_else(|e| {
                warn!(kind = %action.kind, error = %e, "screenshot capture failed");
                None
            })
        } else {
            None
        };
        self.recorder.on_action(action, &state, screenshot.as_deref());
        Ok(state)
    }

    fn snapshot(&self) -> Result<EnvState> {
        self.inner.snapshot()
    }

    fn screenshot(&self) -> Result<Option<Vec<u8>>> {
        self.inner.screenshot()
    }
}

pub struct InstrumentedNoteStore {
    inner: Box<dyn NoteStore>,
    recorder: Arc<dyn Recorder>,
}

impl InstrumentedNoteStore {
    pub fn new(inner: Box<dyn NoteStore>, recorder: Arc<dyn Recorder>) -> Self {
        Self { inner, recorder }
    }
}

impl NoteStore for InstrumentedNoteStore {
    fn add(&mut self, note: Note) -> Result<()> {
        self.inner.add(note.clone())?;
        self.recorder.on_memory(&note);
        Ok(())
    }

    fn entries(&self) -> Result<Vec<Note>> {
        self.inner.entries()
    }

    fn prune(&mut self, max_entries: usize) -> Result<()> {
        self.inner.prune(max_entries)
    }
}

/// Records each event, then forwards it.
pub struct InstrumentedNotifier {
    inner: Box<dyn Notifier>,
    recorder: Arc<dyn Recorder>,
}

impl InstrumentedNotifier {
    pub fn new(inner: Box<dyn Notifier>, recorder: Arc<dyn Recorder>) -> Self {
        Self { inner, recorder }
    }
}

impl Notifier for InstrumentedNotifier {
    fn notify(&self, event: &NotificationEvent) {
        self.recorder.on_notification(event);
        self.inner.notify(event);
    }
}
