//! Remote-display bridge.
//!
//! Exposes the environment to a human (typically over VNC) so they can take
//! over during an intervention. The loop only needs `start` to hand back
//! connection details and `stop` to tear the bridge down.

use std::io::ErrorKind;
use std::process::{Child, Command, Stdio};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::config::DisplayConfig;

/// Where a human can connect to watch or drive the environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub host: String,
    pub port: u16,
    pub display: String,
}

impl ConnectionInfo {
    /// Flatten into notification data fields.
    pub fn to_fields(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert("host".into(), Value::from(self.host.clone()));
        fields.insert("port".into(), Value::from(self.port));
        fields.insert("display".into(), Value::from(self.display.clone()));
        fields
    }

    /// Rebuild from notification data. Accepts the port as a number or a
    /// numeric string.
    pub fn from_fields(data: &Map<String, Value>) -> Option<Self> {
        let host = data.get("host")?.as_str()?.to_string();
        let display = data.get("display")?.as_str()?.to_string();
        let port = match data.get("port")? {
            Value::Number(n) => u16::try_from(n.as_u64()?).ok()?,
            Value::String(s) => s.parse().ok()?,
            _ => return None,
        };
        Some(Self {
            host,
            port,
            display,
        })
    }
}

pub trait RemoteDisplay: Send {
    /// Start the bridge. `None` means no display is available, which is not
    /// an error.
    fn start(&mut self) -> Result<Option<ConnectionInfo>>;

    fn stop(&mut self) -> Result<()>;
}

/// Bridge used when remote display is turned off.
#[derive(Debug, Default)]
pub struct DisabledDisplay;

impl RemoteDisplay for DisabledDisplay {
    fn start(&mut self) -> Result<Option<ConnectionInfo>> {
        info!("remote display disabled; continuing without one");
        Ok(None)
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Bridge backed by an external server process (e.g. `x11vnc`).
///
/// `{display}` and `{port}` in the configured arguments are replaced before
/// spawning.
pub struct CommandDisplay {
    config: DisplayConfig,
    child: Option<Child>,
}

impl CommandDisplay {
    pub fn new(config: DisplayConfig) -> Self {
        Self {
            config,
            child: None,
        }
    }

    fn render_args(&self) -> Vec<String> {
        let port = self.config.port.to_string();
        self.config
            .args
            .iter()
            .map(|arg| {
                arg.replace("{display}", &self.config.display)
                    .replace("{port}", &port)
            })
            .collect()
    }
}

impl RemoteDisplay for CommandDisplay {
    fn start(&mut self) -> Result<Option<ConnectionInfo>> {
        if !self.config.enabled {
            info!("remote display disabled; continuing without one");
            return Ok(None);
        }

        let args = self.render_args();
        debug!(program = %self.config.program, args = ?args, "launching remote display server");
        let spawned = Command::new(&self.config.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();

        let child = match spawned {
            Ok(child) => child,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(
                    program = %self.config.program,
                    "remote display program not found; continuing without a display"
                );
                return Ok(None);
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("failed to launch remote display: {}", self.config.program)
                });
            }
        };

        info!(pid = child.id(), port = self.config.port, "remote display started");
        self.child = Some(child);
        Ok(Some(ConnectionInfo {
            host: self.config.host.clone(),
            port: self.config.port,
            display: self.config.display.clone(),
        }))
    }

    fn stop(&mut self) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        if child
            .try_wait()
            .context("failed to poll remote display process")?
            .is_none()
        {
            debug!(pid = child.id(), "terminating remote display server");
            child.kill().context("failed to kill remote display process")?;
        }
        child.wait().context("failed to reap remote display process")?;
        Ok(())
    }
}

impl Drop for CommandDisplay {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "remote display cleanup failed");
        }
    }
}
