//! Prompt rendering for planners.
//!
//! The loop itself is agnostic to prompt wording; this builder produces a
//! plain-text prompt that text-in/text-out planners (the command planner in
//! particular) can answer with a directive object.

use std::fmt::Write as _;

use crate::environment::EnvState;
use crate::model::Note;
use crate::planner::{ConversationTurn, TurnRole};

const REPLY_FORMAT: &str = "\
Reply with a single JSON object using these keys:
  status          one of continue, wait, wait_for_user, finished, failed
  actions         list of actions, each an object with a \"type\" key
  wait_seconds    optional delay before the next step
  user_request    {reason, instructions} when status is wait_for_user
  memory_to_write list of short notes worth keeping
  message         short summary of this step
  failure_reason  why the task cannot be completed (status failed only)";

/// Renders the per-step prompt from the task and the loop's current view.
#[derive(Debug, Clone, Copy)]
pub struct PromptBuilder<'a> {
    description: &'a str,
    goal: Option<&'a str>,
}

impl<'a> PromptBuilder<'a> {
    pub fn new(description: &'a str, goal: Option<&'a str>) -> Self {
        Self { description, goal }
    }

    pub fn render(
        &self,
        state: &EnvState,
        notes: &[Note],
        history: &[ConversationTurn],
    ) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "## Task\n{}", self.description);
        if let Some(goal) = self.goal {
            let _ = writeln!(out, "\n## Goal\n{goal}");
        }

        out.push_str("\n## Current state\n");
        let _ = writeln!(out, "location: {}", state.location.as_deref().unwrap_or("(unknown)"));
        let _ = writeln!(out, "title: {}", state.title.as_deref().unwrap_or("(unknown)"));
        let _ = writeln!(out, "last action: {}", state.last_action.as_deref().unwrap_or("(none)"));

        out.push_str("\n## Notes\n");
        if notes.is_empty() {
            out.push_str("(empty)\n");
        }
        for note in notes {
            let _ = writeln!(out, "- {}", note.content);
        }

        // User turns are earlier renderings of this prompt; repeating them
        // would nest every previous prompt inside the next one.
        out.push_str("\n## Conversation\n");
        let mut replies = history.iter().filter(|t| t.role != TurnRole::User).peekable();
        if replies.peek().is_none() {
            out.push_str("(no prior conversation)\n");
        }
        for turn in replies {
            let _ = writeln!(out, "[{}] {}", role_label(turn.role), turn.content);
        }

        let _ = write!(out, "\n{REPLY_FORMAT}\n");
        out
    }
}

fn role_label(role: TurnRole) -> &'static str {
    match role {
        TurnRole::System => "system",
        TurnRole::User => "user",
        TurnRole::Assistant => "assistant",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_turns_alone_count_as_no_conversation() {
        let history = vec![ConversationTurn::new(TurnRole::User, "## Task\nold")];
        let prompt = PromptBuilder::new("t", None).render(&EnvState::default(), &[], &history);
        assert!(prompt.contains("(no prior conversation)"));
    }

    #[test]
    fn empty_sections_use_placeholders() {
        let prompt =
            PromptBuilder::new("Book a table", None).render(&EnvState::default(), &[], &[]);
        assert!(prompt.starts_with("## Task\nBook a table\n"));
        assert!(!prompt.contains("## Goal"));
        assert!(prompt.contains("## Notes\n(empty)\n"));
        assert!(prompt.contains("## Conversation\n(no prior conversation)\n"));
        assert!(prompt.contains("wait_for_user"));
    }

    #[test]
    fn renders_goal_state_notes_and_history() {
        let state = EnvState {
            location: Some("https://example.com".to_string()),
            title: Some("Example".to_string()),
            last_action: Some("navigate".to_string()),
        };
        let notes = vec![Note::new("visited")];
        let history = vec![
            ConversationTurn::new(TurnRole::System, "stay on example.com"),
            ConversationTurn::new(TurnRole::User, "## Task\nolder prompt"),
            ConversationTurn::new(TurnRole::Assistant, "continue"),
        ];
        let prompt = PromptBuilder::new("Book a table", Some("two people at 7pm"))
            .render(&state, &notes, &history);

        assert!(prompt.contains("## Goal\ntwo people at 7pm\n"));
        assert!(prompt.contains("location: https://example.com\n"));
        assert!(prompt.contains("last action: navigate\n"));
        assert!(prompt.contains("- visited\n"));
        assert!(prompt.contains("[system] stay on example.com\n[assistant] continue\n"));
        assert!(!prompt.contains("older prompt"));
    }
}
