//! Notification sinks.
//!
//! The loop fires events and forgets them: a sink that cannot deliver logs
//! the failure and moves on, it never fails the task.

use std::io::Write;
use std::time::Duration;

use tracing::{debug, warn};

use crate::model::{NotificationEvent, NotificationLevel};

pub use crate::log::JsonlNotifier;

pub trait Notifier: Send + Sync {
    fn notify(&self, event: &NotificationEvent);
}

/// Prints `[LEVEL] message` lines to stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleNotifier {
    /// Also print the event's data fields.
    pub verbose: bool,
}

impl ConsoleNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn color(level: NotificationLevel) -> &'static str {
        match level {
            NotificationLevel::Info => "36",
            NotificationLevel::Warning => "33",
            NotificationLevel::Error => "31",
            NotificationLevel::Success => "32",
        }
    }
}

pub(crate) fn format_console_line(event: &NotificationEvent) -> String {
    format!(
        "\x1b[{}m[{}]\x1b[0m {}",
        ConsoleNotifier::color(event.level),
        event.level.as_str().to_uppercase(),
        event.message
    )
}

impl Notifier for ConsoleNotifier {
    fn notify(&self, event: &NotificationEvent) {
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "{}", format_console_line(event));
        if self.verbose && !event.data.is_empty() {
            let data = serde_json::Value::Object(event.data.clone());
            let _ = writeln!(out, "\x1b[2m{data}\x1b[0m");
        }
    }
}

/// POSTs each event as JSON to a URL.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    url: String,
    timeout: Duration,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Notifier for WebhookNotifier {
    fn notify(&self, event: &NotificationEvent) {
        match ureq::post(&self.url).timeout(self.timeout).send_json(event) {
            Ok(resp) => debug!(status = resp.status(), kind = %event.kind, "webhook delivered"),
            Err(e) => {
                warn!(url = %self.url, kind = %event.kind, error = %e, "webhook delivery failed")
            }
        }
    }
}

/// Fans each event out to several sinks, in order.
#[derive(Default)]
pub struct CompositeNotifier {
    notifiers: Vec<Box<dyn Notifier>>,
}

impl CompositeNotifier {
    pub fn new(notifiers: Vec<Box<dyn Notifier>>) -> Self {
        Self { notifiers }
    }

    pub fn push(&mut self, notifier: Box<dyn Notifier>) {
        self.notifiers.push(notifier);
    }

    pub fn len(&self) -> usize {
        self.notifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notifiers.is_empty()
    }
}

impl Notifier for CompositeNotifier {
    fn notify(&self, event: &NotificationEvent) {
        for notifier in &self.notifiers {
            notifier.notify(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::event_kind;
    use crate::testing::CollectingNotifier;

    #[test]
    fn console_line_is_coloured_by_level() {
        let event =
            NotificationEvent::new(event_kind::TASK_FAILED, "boom", NotificationLevel::Error);
        assert_eq!(format_console_line(&event), "\x1b[31m[ERROR]\x1b[0m boom");

        let event =
            NotificationEvent::new(event_kind::TASK_FINISHED, "done", NotificationLevel::Success);
        assert_eq!(format_console_line(&event), "\x1b[32m[SUCCESS]\x1b[0m done");
    }

    #[test]
    fn composite_fans_out_in_order() {
        let first = CollectingNotifier::default();
        let second = CollectingNotifier::default();
        let composite =
            CompositeNotifier::new(vec![Box::new(first.clone()), Box::new(second.clone())]);
        assert_eq!(composite.len(), 2);

        composite.notify(&NotificationEvent::new(
            event_kind::TASK_STARTED,
            "go",
            NotificationLevel::Info,
        ));
        composite.notify(&NotificationEvent::new(
            event_kind::LLM_STEP,
            "step",
            NotificationLevel::Info,
        ));

        assert_eq!(first.kinds(), vec![event_kind::TASK_STARTED, event_kind::LLM_STEP]);
        assert_eq!(second.kinds(), first.kinds());
    }

    #[test]
    fn webhook_failure_is_swallowed() {
        let notifier = WebhookNotifier::new("http://127.0.0.1:9/hook")
            .with_timeout(Duration::from_millis(200));
        notifier.notify(&NotificationEvent::new(
            event_kind::TASK_STARTED,
            "go",
            NotificationLevel::Info,
        ));
    }

    #[test]
    fn notifier_is_object_safe() {
        let sink: Box<dyn Notifier> = Box::new(ConsoleNotifier::new());
        sink.notify(&NotificationEvent::new(
            event_kind::TASK_STARTED,
            "go",
            NotificationLevel::Info,
        ));
    }
}
