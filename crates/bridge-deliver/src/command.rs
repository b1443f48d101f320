//! External command delivery

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::{DeliverError, DeliverResult, DeliverySink};

/// Default time allowed for the spawned command to finish
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// Delivers by spawning an external command
///
/// The trigger text is appended as the final argument. The child is
/// abandoned (and killed) if it exceeds the timeout.
pub struct CommandSink {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandSink {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl DeliverySink for CommandSink {
    async fn deliver(&self, message: &str) -> DeliverResult<()> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .arg(message)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| DeliverError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| DeliverError::Timeout {
                program: self.program.clone(),
                timeout_secs: self.timeout.as_secs(),
            })?
            .map_err(|source| DeliverError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(DeliverError::CommandFailed {
                program: self.program.clone(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        debug!(program = %self.program, "Delivered trigger via command");
        Ok(())
    }
}
