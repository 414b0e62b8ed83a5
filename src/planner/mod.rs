//! Planner seam.
//!
//! A planner turns the rendered prompt plus the loop's context into the next
//! [`Directive`]. Real planners wrap an LLM; this crate ships a scripted
//! planner for offline runs and a command planner that shells out to any
//! program speaking the directive JSON format.

mod command;
mod parse;

pub use command::CommandPlanner;
pub use parse::{extract_json_object, parse_directive};

use std::collections::VecDeque;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::environment::EnvState;
use crate::model::{Directive, Note};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    System,
    User,
    Assistant,
}

/// One entry of the loop's conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: TurnRole,
    pub content: String,
}

impl ConversationTurn {
    pub fn new(role: TurnRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Everything the planner may look at besides the prompt text.
#[derive(Debug, Clone, Copy)]
pub struct PlannerContext<'a> {
    pub task_description: &'a str,
    pub goal: Option<&'a str>,
    pub state: &'a EnvState,
    pub notes: &'a [Note],
    pub history: &'a [ConversationTurn],
}

pub trait Planner: Send {
    fn complete(&mut self, prompt: &str, context: &PlannerContext<'_>) -> Result<Directive>;

    /// Turns that seed the conversation history.
    fn start_conversation(&self) -> Vec<ConversationTurn> {
        Vec::new()
    }
}

/// Replays a fixed queue of directives.
#[derive(Debug, Clone, Default)]
pub struct ScriptedPlanner {
    responses: VecDeque<Directive>,
    system_prompt: Option<String>,
}

impl ScriptedPlanner {
    pub fn new(responses: impl IntoIterator<Item = Directive>) -> Self {
        Self {
            responses: responses.into_iter().collect(),
            system_prompt: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn remaining(&self) -> usize {
        self.responses.len()
    }
}

impl Planner for ScriptedPlanner {
    fn complete(&mut self, _prompt: &str, _context: &PlannerContext<'_>) -> Result<Directive> {
        self.responses
            .pop_front()
            .ok_or_else(|| anyhow!("scripted planner ran out of directives"))
    }

    fn start_conversation(&self) -> Vec<ConversationTurn> {
        self.system_prompt
            .iter()
            .map(|p| ConversationTurn::new(TurnRole::System, p.clone()))
            .collect()
    }
}
