//! Planner backed by an external program.
//!
//! The rendered prompt goes to the program's stdin; its stdout must contain a
//! directive object (see [`parse_directive`]). The child is killed if it runs
//! past the configured timeout.

use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

use super::{ConversationTurn, Planner, PlannerContext, TurnRole, parse_directive};
use crate::config::PlannerConfig;
use crate::model::Directive;

#[derive(Debug, Clone)]
pub struct CommandPlanner {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    system_prompt: Option<String>,
}

impl CommandPlanner {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
            system_prompt: None,
        }
    }

    pub fn from_config(config: &PlannerConfig) -> Result<Self> {
        let program = config
            .program
            .clone()
            .ok_or_else(|| anyhow!("planner.program is required for the command planner"))?;
        let mut planner = Self::new(
            program,
            config.args.clone(),
            Duration::from_secs(config.timeout_secs),
        );
        planner.system_prompt = config.system_prompt.clone();
        Ok(planner)
    }

    fn run(&self, prompt: &str) -> Result<String> {
        debug!(program = %self.program, prompt_len = prompt.len(), "calling planner command");
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to run planner command: {}", self.program))?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("planner stdout was not piped"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("planner stderr was not piped"))?;
        let stdout_reader = thread::spawn(move || {
            let mut buf = Vec::new();
            stdout.read_to_end(&mut buf).map(|_| buf)
        });
        let stderr_reader = thread::spawn(move || {
            let mut buf = Vec::new();
            stderr.read_to_end(&mut buf).map(|_| buf)
        });

        if let Some(mut stdin) = child.stdin.take() {
            // A planner that ignores stdin may exit before reading it.
            if let Err(e) = stdin.write_all(prompt.as_bytes()) {
                debug!(error = %e, "planner closed stdin early");
            }
        }

        let status = match child.wait_timeout(self.timeout).context("wait for planner")? {
            Some(status) => status,
            None => {
                warn!(timeout_secs = self.timeout.as_secs(), "planner timed out, killing");
                child.kill().context("kill planner")?;
                child.wait().context("wait planner after kill")?;
                bail!(
                    "planner command timed out after {}s: {}",
                    self.timeout.as_secs(),
                    self.program
                );
            }
        };

        let stdout = stdout_reader
            .join()
            .map_err(|_| anyhow!("planner stdout reader panicked"))?
            .context("read planner stdout")?;
        let stderr = stderr_reader
            .join()
            .map_err(|_| anyhow!("planner stderr reader panicked"))?
            .context("read planner stderr")?;

        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr);
            bail!(
                "planner exited with {}: {}",
                status.code().map_or_else(|| "signal".to_string(), |c| c.to_string()),
                stderr.trim()
            );
        }
        Ok(String::from_utf8_lossy(&stdout).into_owned())
    }
}

impl Planner for CommandPlanner {
    fn complete(&mut self, prompt: &str, _context: &PlannerContext<'_>) -> Result<Directive> {
        let reply = self.run(prompt)?;
        let directive = parse_directive(&reply)?;
        info!(
            status = directive.status.as_str(),
            actions = directive.actions.len(),
            "planner answered"
        );
        Ok(directive)
    }

    fn start_conversation(&self) -> Vec<ConversationTurn> {
        self.system_prompt
            .iter()
            .map(|p| ConversationTurn::new(TurnRole::System, p.clone()))
            .collect()
    }
}
