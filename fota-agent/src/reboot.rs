//! Reboot boundary
//!
//! Rebooting is modeled as an injectable trigger so tests can observe the
//! call instead of taking the host down. The production binding asks the
//! OS to restart; the process is expected to be torn down shortly after.

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::info;

#[derive(Debug, Error)]
#[error("reboot failed: {0}")]
pub struct RebootError(pub String);

/// Requests a device restart.
#[async_trait]
pub trait RebootTrigger: Send + Sync {
    async fn reboot(&self) -> Result<(), RebootError>;
}

/// Reboots through the system `shutdown` command.
pub struct SystemReboot;

#[async_trait]
impl RebootTrigger for SystemReboot {
    async fn reboot(&self) -> Result<(), RebootError> {
        info!("requesting system reboot");
        let status = Command::new("shutdown")
            .args(["-r", "now"])
            .status()
            .await
            .map_err(|e| RebootError(e.to_string()))?;

        if status.success() {
            Ok(())
        } else {
            Err(RebootError(format!("shutdown exited with {status}")))
        }
    }
}
