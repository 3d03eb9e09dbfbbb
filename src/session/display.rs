//! Virtual display server owned by one process session.

use std::process::Stdio;

use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::config::DisplayConfig;

use super::SessionError;

/// A running display server (Xvfb by default) bound to `:N`.
///
/// The child is spawned with `kill_on_drop`, so dropping the handle without
/// calling `stop` still terminates the server.
pub struct VirtualDisplay {
    number: u32,
    child: Child,
}

impl VirtualDisplay {
    /// Display number used by `worker_id`.
    pub fn number_for(config: &DisplayConfig, worker_id: usize) -> u32 {
        config.first_display.saturating_add(worker_id as u32)
    }

    /// Starts the display server for `worker_id` and waits `startup_delay`.
    pub async fn start(config: &DisplayConfig, worker_id: usize) -> Result<Self, SessionError> {
        let number = Self::number_for(config, worker_id);

        let mut child = Command::new(&config.program)
            .arg(format!(":{}", number))
            .args(&config.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                SessionError::Startup(format!("failed to spawn {}: {}", config.program, e))
            })?;

        tokio::time::sleep(config.startup_delay).await;

        if let Some(status) = child.try_wait()? {
            return Err(SessionError::Startup(format!(
                "display server :{} exited during startup with {}",
                number, status
            )));
        }

        info!(worker_id = worker_id, display = number, "Virtual display started");
        Ok(Self { number, child })
    }

    /// Display number, as in `DISPLAY=:N`.
    pub fn number(&self) -> u32 {
        self.number
    }

    /// Value for the `DISPLAY` environment variable.
    pub fn env_value(&self) -> String {
        format!(":{}", self.number)
    }

    /// Stops the display server.
    pub async fn stop(mut self) {
        if let Err(e) = self.child.start_kill() {
            // Already exited.
            debug!(display = self.number, error = %e, "Display server not running");
        }
        match self.child.wait().await {
            Ok(status) => debug!(display = self.number, status = %status, "Virtual display stopped"),
            Err(e) => warn!(display = self.number, error = %e, "Failed to reap display server"),
        }
    }
}
