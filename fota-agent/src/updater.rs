//! Updater boundary
//!
//! The external tool that actually installs, commits and rolls back
//! firmware images. The trait keeps the session testable; the production
//! binding shells out to the update tool and streams its stdout as
//! progress lines.

use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Errors from the update tool.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("{program} exited with {status}")]
    Failed {
        program: String,
        status: std::process::ExitStatus,
    },

    #[error("{0}")]
    Other(String),
}

/// A running install.
///
/// Progress lines arrive on `progress` until the tool finishes; the
/// terminal outcome arrives exactly once on `result`. `abort` kills the
/// underlying task, used when the install deadline expires.
pub struct InstallHandle {
    pub progress: mpsc::Receiver<String>,
    pub result: oneshot::Receiver<Result<(), UpdateError>>,
    task: tokio::task::JoinHandle<()>,
}

impl InstallHandle {
    pub fn new(
        progress: mpsc::Receiver<String>,
        result: oneshot::Receiver<Result<(), UpdateError>>,
        task: tokio::task::JoinHandle<()>,
    ) -> Self {
        Self {
            progress,
            result,
            task,
        }
    }

    /// Stops the running install. The result channel will yield a closed
    /// error instead of a terminal outcome.
    pub fn abort(&self) {
        self.task.abort();
    }
}

/// The install/commit/rollback capability of the device.
#[async_trait]
pub trait Updater: Send + Sync {
    /// Starts an install in the background and returns the handle to
    /// observe it.
    fn install(&self, url: &str) -> InstallHandle;

    /// Makes the currently running (freshly installed) image permanent.
    async fn commit(&self) -> Result<(), UpdateError>;

    /// Reverts to the previous image.
    async fn rollback(&self) -> Result<(), UpdateError>;
}

/// Updater backed by a command-line tool following the
/// `-install <url>` / `-commit` / `-rollback` argument convention.
pub struct CommandUpdater {
    program: String,
}

impl CommandUpdater {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl Updater for CommandUpdater {
    fn install(&self, url: &str) -> InstallHandle {
        let (progress_tx, progress_rx) = mpsc::channel(32);
        let (result_tx, result_rx) = oneshot::channel();
        let program = self.program.clone();
        let url = url.to_string();

        let task = tokio::spawn(async move {
            let result = run_streaming(&program, &["-install", &url], progress_tx).await;
            let _ = result_tx.send(result);
        });

        InstallHandle::new(progress_rx, result_rx, task)
    }

    async fn commit(&self) -> Result<(), UpdateError> {
        run_to_completion(&self.program, &["-commit"]).await
    }

    async fn rollback(&self) -> Result<(), UpdateError> {
        run_to_completion(&self.program, &["-rollback"]).await
    }
}

/// Runs the tool, forwarding each stdout line as a progress message.
async fn run_streaming(
    program: &str,
    args: &[&str],
    progress: mpsc::Sender<String>,
) -> Result<(), UpdateError> {
    let mut child = Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .spawn()
        .map_err(|e| UpdateError::Spawn {
            program: program.to_string(),
            source: e,
        })?;

    if let Some(stdout) = child.stdout.take() {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!("{}: {}", program, line);
            // keep draining even if the receiver is gone, so the child
            // never blocks on a full pipe
            let _ = progress.send(line).await;
        }
    }

    let status = child.wait().await.map_err(|e| UpdateError::Spawn {
        program: program.to_string(),
        source: e,
    })?;

    if status.success() {
        Ok(())
    } else {
        Err(UpdateError::Failed {
            program: program.to_string(),
            status,
        })
    }
}

/// Runs the tool to completion, capturing output for the log.
async fn run_to_completion(program: &str, args: &[&str]) -> Result<(), UpdateError> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| UpdateError::Spawn {
            program: program.to_string(),
            source: e,
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !stdout.trim().is_empty() {
        debug!("{} stdout: {}", program, stdout.trim());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        debug!("{} stderr: {}", program, stderr.trim());
    }

    if output.status.success() {
        Ok(())
    } else {
        Err(UpdateError::Failed {
            program: program.to_string(),
            status: output.status,
        })
    }
}
