//! Wire payloads exchanged with the job service
//!
//! Three shapes cross the transport boundary:
//! - incoming job envelopes (`{"execution": {...}}`) delivered on the
//!   notification topics,
//! - outgoing status updates published on a job's `update` topic,
//! - incoming echoes on the `update/accepted` topic, carrying the service's
//!   canonical version counter.

use serde::{Deserialize, Serialize};

use crate::error::DecodeError;
use crate::job::{ExecutionRecord, JobDocument, JobStatus, StatusDetails};

/// Outer envelope of a job notification.
///
/// Payloads without an `execution` section are delivered on the same topics
/// (for example empty `start-next` acknowledgments) and are not jobs.
#[derive(Debug, Deserialize)]
pub struct JobEnvelope {
    #[serde(default)]
    pub execution: Option<JobExecutionState>,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

/// The `execution` section of a job envelope.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobExecutionState {
    pub job_id: String,
    #[serde(default)]
    pub status: Option<JobStatus>,
    #[serde(default)]
    pub status_details: StatusDetails,
    #[serde(default)]
    pub job_document: JobDocument,
    #[serde(default)]
    pub version_number: i64,
    #[serde(default)]
    pub execution_number: i64,
    #[serde(default)]
    pub queued_at: i64,
    #[serde(default)]
    pub started_at: i64,
    #[serde(default)]
    pub last_updated_at: i64,
}

impl JobExecutionState {
    /// Builds the locally owned execution record for this delivery.
    pub fn into_record(self, thing_id: impl Into<String>) -> ExecutionRecord {
        ExecutionRecord {
            job_id: self.job_id,
            thing_id: thing_id.into(),
            status: self.status.unwrap_or(JobStatus::Queued),
            status_details: self.status_details,
            version_number: self.version_number,
            execution_number: self.execution_number,
        }
    }
}

/// Decodes an incoming payload into the job execution it carries.
///
/// Distinguishes "not a job" (no `execution` section, ignore silently) from
/// "malformed job" (claimed to be a job but did not parse).
pub fn decode_job(payload: &[u8]) -> Result<JobExecutionState, DecodeError> {
    let envelope: JobEnvelope = serde_json::from_slice(payload)?;
    envelope.execution.ok_or(DecodeError::NotAJob)
}

/// Outgoing status update for a job's `update` topic.
///
/// `expected_version` is the locally tracked version number; the service
/// ignores the update if it does not match its own counter.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdatePayload<'a> {
    pub status: JobStatus,
    pub status_details: &'a StatusDetails,
    pub expected_version: i64,
    pub execution_number: i64,
    pub include_job_execution_state: bool,
    pub client_token: &'a str,
}

impl<'a> StatusUpdatePayload<'a> {
    pub fn from_record(record: &'a ExecutionRecord, client_token: &'a str) -> Self {
        Self {
            status: record.status,
            status_details: &record.status_details,
            expected_version: record.version_number,
            execution_number: record.execution_number,
            include_job_execution_state: true,
            client_token,
        }
    }
}

/// Incoming echo of an accepted status update.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EchoPayload {
    #[serde(default)]
    pub execution_state: Option<EchoExecutionState>,
}

/// The `executionState` section of an echo, carrying the canonical version
/// counter to use as the next `expectedVersion`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EchoExecutionState {
    #[serde(default)]
    pub status: Option<JobStatus>,
    #[serde(default)]
    pub status_details: StatusDetails,
    pub version_number: i64,
}

/// Best-effort progress line for the monitoring topic.
#[derive(Debug, Serialize, Deserialize)]
pub struct ProgressPayload {
    pub progress: String,
    pub ts: i64,
}
