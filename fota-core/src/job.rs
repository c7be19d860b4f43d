//! Job domain types
//!
//! The operations this agent executes, the lifecycle status vocabulary of
//! the job service, and the execution record the agent keeps synchronized
//! with the service while a job runs.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{JobError, codes};

/// Status details attached to every status report.
///
/// An ordered string-to-string map; the one semantically meaningful key is
/// `"step"` (see [`Step`]).
pub type StatusDetails = BTreeMap<String, String>;

/// Job execution status as tracked by the job service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    InProgress,
    Succeeded,
    Failed,
    Rejected,
}

/// The raw job document as delivered inside a job envelope.
///
/// Kept permissive on purpose: validation happens in
/// [`Operation::from_document`], which turns this into a typed operation or
/// a reportable [`JobError`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobDocument {
    #[serde(default)]
    pub operation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// A validated job operation.
///
/// Exactly two operations exist; anything else is a validation failure at
/// decode time, never a silently defaulted variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Install a new firmware image fetched from `url`.
    Install { url: String },
    /// Roll the device back to the previous image.
    Rollback,
}

impl Operation {
    /// Validates a job document into a typed operation.
    ///
    /// Returns a [`JobError`] with a distinct code per cause so the caller
    /// can reject the job with a precise reason.
    pub fn from_document(doc: &JobDocument) -> Result<Self, JobError> {
        match doc.operation.as_str() {
            "install" => match doc.url.as_deref() {
                Some(url) if !url.is_empty() => Ok(Operation::Install {
                    url: url.to_string(),
                }),
                _ => Err(JobError::new(codes::MISSING_URL, "missing url parameter")),
            },
            "rollback" => Ok(Operation::Rollback),
            _ => Err(JobError::new(
                codes::INVALID_OPERATION,
                "unrecognized or missing operation",
            )),
        }
    }
}

/// The persisted progress marker inside a job's status details.
///
/// This is the agent's *entire* durable memory: after a reboot the job is
/// redelivered with the last step the service recorded, and the session
/// decides from it whether to install or commit. Unknown step text parses
/// as [`Step::Fresh`]: the resume decision only distinguishes `rebooting`
/// from everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Step {
    #[default]
    Fresh,
    Installing,
    Rebooting,
    Rebooted,
    Committed,
    RolledBack,
}

impl Step {
    pub const KEY: &'static str = "step";

    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Fresh => "",
            Step::Installing => "installing",
            Step::Rebooting => "rebooting",
            Step::Rebooted => "rebooted",
            Step::Committed => "committed",
            Step::RolledBack => "rolled_back",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "installing" => Step::Installing,
            "rebooting" => Step::Rebooting,
            "rebooted" => Step::Rebooted,
            "committed" => Step::Committed,
            "rolled_back" => Step::RolledBack,
            _ => Step::Fresh,
        }
    }

    /// Reads the step out of a status-details map.
    pub fn from_details(details: &StatusDetails) -> Self {
        details
            .get(Self::KEY)
            .map(|s| Step::parse(s))
            .unwrap_or_default()
    }

    /// Builds the status details for a report of this step.
    pub fn details(&self) -> StatusDetails {
        let mut details = StatusDetails::new();
        details.insert(Self::KEY.to_string(), self.as_str().to_string());
        details
    }
}

/// One job's execution record, mirrored from the job service.
///
/// The `version_number` implements the optimistic-versioning protocol:
/// every status publish carries it as `expectedVersion`, and the service
/// only accepts the update if it matches its own counter. The owning
/// reporter resynchronizes it from echoed acknowledgments.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub job_id: String,
    pub thing_id: String,
    pub status: JobStatus,
    pub status_details: StatusDetails,
    pub version_number: i64,
    pub execution_number: i64,
}
