//! Long-term notes written by the planner.

use anyhow::Result;

use crate::model::Note;

/// Storage for notes the planner asked to keep across steps.
pub trait NoteStore: Send {
    fn add(&mut self, note: Note) -> Result<()>;

    /// All notes, oldest first.
    fn entries(&self) -> Result<Vec<Note>>;

    /// Keep only the `max_entries` most recent notes.
    fn prune(&mut self, max_entries: usize) -> Result<()>;
}

/// Bounded in-memory note store.
#[derive(Debug, Clone)]
pub struct InMemoryNoteStore {
    notes: Vec<Note>,
    max_entries: usize,
}

impl InMemoryNoteStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            notes: Vec::new(),
            max_entries,
        }
    }
}

impl NoteStore for InMemoryNoteStore {
    fn add(&mut self, note: Note) -> Result<()> {
        self.notes.push(note);
        self.prune(self.max_entries)
    }

    fn entries(&self) -> Result<Vec<Note>> {
        Ok(self.notes.clone())
    }

    fn prune(&mut self, max_entries: usize) -> Result<()> {
        if self.notes.len() > max_entries {
            let excess = self.notes.len() - max_entries;
            self.notes.drain(..excess);
        }
        Ok(())
    }
}
