//! Error types shared across the agent

use thiserror::Error;

/// Error codes reported to the job service.
///
/// The code travels in the `statusDetails` of a terminal report, so the
/// service operator can tell which stage of the update went wrong without
/// parsing free-form text.
pub mod codes {
    /// Payload could not be interpreted as a job at all.
    pub const INVALID_JOB: &str = "ERR_INVALID_JOB";
    /// Job document names an operation this agent does not implement.
    pub const INVALID_OPERATION: &str = "ERR_INVALID_OPERATION";
    /// Install job without a source URL.
    pub const MISSING_URL: &str = "ERR_MISSING_URL";
    /// The updater reported a failed install.
    pub const INSTALL_FAILED: &str = "ERR_INSTALL_FAILED";
    /// The install did not finish within the configured deadline.
    pub const INSTALL_TIMEOUT: &str = "ERR_INSTALL_TIMEOUT";
    /// Commit of an installed image failed after the reboot.
    pub const COMMIT_FAILED: &str = "ERR_COMMIT_FAILED";
    /// The updater could not roll back to the previous image.
    pub const ROLLBACK_FAILED: &str = "ERR_ROLLBACK_FAILED";
    /// The reboot trigger itself failed.
    pub const REBOOT_FAILED: &str = "ERR_REBOOT_FAILED";
}

/// A job-level error: a stable code plus a human-readable message.
///
/// This is what terminal `Fail`/`Reject` reports carry back to the service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("code {code}, msg: {message}")]
pub struct JobError {
    pub code: String,
    pub message: String,
}

impl JobError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Errors produced while decoding an incoming job payload.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The payload has no `execution` section, so it is not a job
    /// notification and must be ignored without a job-level report.
    #[error("payload has no \"execution\" section")]
    NotAJob,

    /// The payload claimed to be a job but did not parse.
    #[error("malformed job payload: {0}")]
    Malformed(#[from] serde_json::Error),
}
