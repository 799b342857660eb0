//! Processor that runs an external executable per unit of work.
//!
//! The unit is written as JSON to the hook's stdin. Exit status 0 is success,
//! any other status is a classified failure carrying the status code and the
//! hook's stderr. Failing to spawn or exceeding the timeout is a raised error.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use tokio::io::AsyncWriteExt as _;
use tokio::process::Command;
use tracing::debug;

use super::Processor;
use crate::model::UnitOfWork;
use crate::store::{ActionError, ActionResult};

/// Longest stderr excerpt carried in a failure message.
const MAX_STDERR_BYTES: usize = 2048;

#[derive(Debug, Clone)]
pub struct HookProcessor {
    command: PathBuf,
    timeout: Duration,
}

impl HookProcessor {
    pub fn new(command: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }

    /// Resolve relative hook paths against the process CWD.
    fn resolve(command: &Path) -> std::io::Result<PathBuf> {
        if command.is_relative() && command.components().count() > 1 {
            Ok(std::env::current_dir()?.join(command))
        } else {
            Ok(command.to_path_buf())
        }
    }
}

#[async_trait]
impl Processor for HookProcessor {
    async fn process(&self, unit: &UnitOfWork) -> anyhow::Result<ActionResult> {
        let command = Self::resolve(&self.command)?;
        let input = serde_json::to_vec(unit).context("serialize unit of work")?;

        debug!(uow_id = %unit.id, command = %command.display(), "running hook");

        let mut child = Command::new(&command)
            .env("UOWQ_UOW_ID", &unit.id)
            .env("UOWQ_CREATION_EPOCH", unit.creation_epoch.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawn hook {}", command.display()))?;

        // The timeout covers the stdin write as well as the wait.
        let stdin = child.stdin.take();
        let run = async move {
            if let Some(mut stdin) = stdin {
                match stdin.write_all(&input).await {
                    Ok(()) => {}
                    // The hook may exit without reading its input.
                    Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                    Err(e) => return Err(e).context("write hook stdin"),
                }
            }
            child.wait_with_output().await.context("wait for hook")
        };

        let output = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| anyhow::anyhow!("hook timed out after {:?}", self.timeout))??;

        if output.status.success() {
            return Ok(Ok(()));
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let mut message = stderr.trim().to_string();
        if message.len() > MAX_STDERR_BYTES {
            let mut cut = MAX_STDERR_BYTES;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
        }
        if message.is_empty() {
            message = format!("hook exited with {}", output.status);
        }

        Ok(Err(ActionError::new(output.status.code().unwrap_or(-1), message)))
    }
}
