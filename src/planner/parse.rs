//! Parsing planner replies into directives.
//!
//! Planners are told to answer with a single JSON object, but LLM output
//! often wraps it in a Markdown fence or surrounds it with prose.

use std::sync::OnceLock;

use anyhow::{Context, Result, bail};
use regex::Regex;
use serde_json::Value;

use crate::model::Directive;

fn fence_pattern() -> &'static Regex {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    FENCE.get_or_init(|| {
        Regex::new(r"(?s)^\s*```[A-Za-z0-9_-]*[ \t]*\r?\n(.*?)\r?\n?\s*```\s*$")
            .expect("fence pattern is valid")
    })
}

/// Pull the outermost JSON object out of `text`.
pub fn extract_json_object(text: &str) -> Result<Value> {
    let body = match fence_pattern().captures(text) {
        Some(caps) => caps.get(1).map_or(text, |m| m.as_str()),
        None => text,
    };

    let (Some(start), Some(end)) = (body.find('{'), body.rfind('}')) else {
        bail!("planner reply contains no JSON object");
    };
    if end < start {
        bail!("planner reply contains no JSON object");
    }
    serde_json::from_str(&body[start..=end]).context("planner reply is not valid JSON")
}

/// Parse a planner reply into a [`Directive`].
pub fn parse_directive(text: &str) -> Result<Directive> {
    let value = extract_json_object(text)?;
    serde_json::from_value(value).context("planner reply is not a valid directive")
}
