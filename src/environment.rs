//! Environment driver seam.
//!
//! The loop hands opaque [`Action`]s to an [`Environment`] and gets back the
//! resulting [`EnvState`]. A concrete browser driver lives outside this crate;
//! [`ScriptedEnvironment`] is the offline driver used for dry runs and tests.

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::EnvironmentConfig;
use crate::model::Action;

/// Point-in-time description of the environment.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvState {
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub last_action: Option<String>,
}

pub trait Environment: Send {
    fn start(&mut self) -> Result<()>;

    fn stop(&mut self) -> Result<()>;

    /// Execute one action and return the state it left behind.
    fn execute(&mut self, action: &Action) -> Result<EnvState>;

    fn snapshot(&self) -> Result<EnvState>;

    /// Screenshot of the current state, if the driver can produce one.
    fn screenshot(&self) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }
}

/// Offline driver that follows `url` parameters and remembers what it ran.
#[derive(Debug, Clone, Default)]
pub struct ScriptedEnvironment {
    state: EnvState,
    executed: Vec<Action>,
    screenshot: Option<Vec<u8>>,
    running: bool,
}

impl ScriptedEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &EnvironmentConfig) -> Self {
        let mut env = Self::new();
        env.state.location = config.start_location.clone();
        env.state.title = config.title.clone();
        if config.screenshots {
            env.screenshot = Some(placeholder_png());
        }
        env
    }

    pub fn with_screenshot(mut self, bytes: Vec<u8>) -> Self {
        self.screenshot = Some(bytes);
        self
    }

    pub fn executed(&self) -> &[Action] {
        &self.executed
    }
}

impl Environment for ScriptedEnvironment {
    fn start(&mut self) -> Result<()> {
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.running = false;
        Ok(())
    }

    fn execute(&mut self, action: &Action) -> Result<EnvState> {
        if !self.running {
            bail!("environment not started; cannot run '{}'", action.kind);
        }
        debug!(kind = %action.kind, "executing scripted action");
        if let Some(url) = action.param_str("url") {
            self.state.location = Some(url.to_string());
        }
        if let Some(title) = action.param_str("title") {
            self.state.title = Some(title.to_string());
        }
        self.state.last_action = Some(action.kind.clone());
        self.executed.push(action.clone());
        Ok(self.state.clone())
    }

    fn snapshot(&self) -> Result<EnvState> {
        Ok(self.state.clone())
    }

    fn screenshot(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.screenshot.clone())
    }
}

/// 8-byte PNG signature; enough for artifact plumbing without a renderer.
fn placeholder_png() -> Vec<u8> {
    vec![0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n']
}
