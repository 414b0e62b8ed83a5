//! Builds collaborators from configuration.

use std::path::PathBuf;

use anyhow::{Result, bail};

use crate::config::RunnerConfig;
use crate::display::{CommandDisplay, RemoteDisplay};
use crate::environment::{Environment, ScriptedEnvironment};
use crate::notes::{InMemoryNoteStore, NoteStore};
use crate::notify::{ConsoleNotifier, JsonlNotifier, Notifier, WebhookNotifier};
use crate::planner::{CommandPlanner, Planner, ScriptedPlanner};

/// Source of the per-task collaborators handed to the orchestrator.
///
/// Called on the task's worker thread, once per task.
pub trait CollaboratorFactory: Send + Sync {
    fn planner(&self, config: &RunnerConfig) -> Result<Box<dyn Planner>>;

    fn environment(&self, config: &RunnerConfig) -> Result<Box<dyn Environment>>;

    fn notes(&self, config: &RunnerConfig) -> Result<Box<dyn NoteStore>> {
        Ok(Box::new(InMemoryNoteStore::new(config.memory_max_entries)))
    }

    fn notifier(&self, config: &RunnerConfig, task_id: &str) -> Result<Box<dyn Notifier>> {
        build_notifier(config, task_id)
    }

    /// `None` when remote display is disabled.
    fn display(&self, config: &RunnerConfig) -> Result<Option<Box<dyn RemoteDisplay>>> {
        if !config.display.enabled {
            return Ok(None);
        }
        Ok(Some(Box::new(CommandDisplay::new(config.display.clone()))))
    }
}

/// Maps configuration names onto the implementations in this crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultFactory;

impl CollaboratorFactory for DefaultFactory {
    fn planner(&self, config: &RunnerConfig) -> Result<Box<dyn Planner>> {
        let planner = &config.planner;
        match planner.provider.as_str() {
            "scripted" => {
                let mut scripted = ScriptedPlanner::new(planner.responses.clone());
                if let Some(prompt) = &planner.system_prompt {
                    scripted = scripted.with_system_prompt(prompt.clone());
                }
                Ok(Box::new(scripted))
            }
            "command" => Ok(Box::new(CommandPlanner::from_config(planner)?)),
            other => bail!("unknown planner provider: {other}"),
        }
    }

    fn environment(&self, config: &RunnerConfig) -> Result<Box<dyn Environment>> {
        match config.environment.driver.as_str() {
            "scripted" => Ok(Box::new(ScriptedEnvironment::from_config(&config.environment))),
            other => bail!("unknown environment driver: {other}"),
        }
    }
}

pub fn build_notifier(config: &RunnerConfig, task_id: &str) -> Result<Box<dyn Notifier>> {
    let notifications = &config.notifications;
    match notifications.channel.as_str() {
        "console" => Ok(Box::new(ConsoleNotifier::new())),
        "jsonl" => {
            let Some(target) = &notifications.target else {
                bail!("notifications.target must name a file for the jsonl channel");
            };
            let notifier = JsonlNotifier::new(&PathBuf::from(target))?.with_task_id(task_id);
            Ok(Box::new(notifier))
        }
        "webhook" => {
            let Some(target) = &notifications.target else {
                bail!("notifications.target must be a URL for the webhook channel");
            };
            Ok(Box::new(WebhookNotifier::new(target.clone())))
        }
        other => bail!("unknown notification channel: {other}"),
    }
}
