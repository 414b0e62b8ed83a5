//! Manual pause mailbox.
//!
//! An operator asks a running task to yield control by queueing a pause
//! request here. The task's own loop drains it at the next iteration boundary,
//! so the request never races an action that is already executing.
//!
//! The controller is a single-slot mailbox with two positions:
//!
//! ```text
//! request_pause()    consume_pending()        clear_active()
//!   ──────────► PENDING ──────────► ACTIVE ──────────► (empty)
//! ```
//!
//! At most one of the two positions is occupied at any time.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::model::{InterventionRequest, SOURCE_KEY, SOURCE_MANUAL_PAUSE};

/// A pause request issued by an operator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManualPauseRequest {
    pub request: InterventionRequest,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Slots {
    pending: Option<ManualPauseRequest>,
    active: Option<ManualPauseRequest>,
}

impl Slots {
    fn occupied(&self) -> bool {
        self.pending.is_some() || self.active.is_some()
    }
}

/// Thread-safe pause mailbox shared between operators and one task loop.
#[derive(Debug, Default)]
pub struct ManualPauseController {
    slots: Mutex<Slots>,
}

impl ManualPauseController {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a pause request unless one is already pending or being handled.
    ///
    /// Caller metadata is merged into the request; `source` is always
    /// `manual_pause`.
    pub fn request_pause(
        &self,
        reason: &str,
        instructions: &str,
        metadata: Option<BTreeMap<String, Value>>,
    ) -> bool {
        let mut slots = self.slots();
        if slots.occupied() {
            debug!(reason, "pause rejected: another request is outstanding");
            return false;
        }

        let mut request = InterventionRequest::new(reason, instructions);
        request.metadata.extend(metadata.unwrap_or_default());
        request.metadata.insert(
            SOURCE_KEY.to_string(),
            Value::String(SOURCE_MANUAL_PAUSE.to_string()),
        );

        slots.pending = Some(ManualPauseRequest {
            request,
            created_at: Utc::now(),
        });
        info!(reason, "manual pause queued");
        true
    }

    /// Move the pending request to the active slot and return it.
    ///
    /// Only the task loop calls this.
    pub fn consume_pending(&self) -> Option<ManualPauseRequest> {
        let mut slots = self.slots();
        let pending = slots.pending.take()?;
        slots.active = Some(pending.clone());
        Some(pending)
    }

    pub fn get_active(&self) -> Option<ManualPauseRequest> {
        self.slots().active.clone()
    }

    pub fn clear_active(&self) {
        self.slots().active = None;
    }

    /// Pending-or-active request, for status reporting.
    pub fn snapshot(&self) -> Option<ManualPauseRequest> {
        let slots = self.slots();
        slots.pending.clone().or_else(|| slots.active.clone())
    }
}
