//! Job status reporter
//!
//! Owns one job's execution record for the lifetime of that job and is its
//! single mutator. Every status publish carries the locally tracked version
//! number as `expectedVersion`; the service silently ignores mismatches, so
//! the reporter resynchronizes the counter from the echoes the service
//! publishes for every accepted update.
//!
//! The echo callback and the publishing path both serialize through one
//! mutex; no other component touches the record directly.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use fota_core::envelope::{EchoPayload, ProgressPayload, StatusUpdatePayload};
use fota_core::{ExecutionRecord, JobError, JobStatus, StatusDetails, TopicScheme};
use fota_transport::{InboundMessage, MessageHandler, QosLevel, Transport, TransportError};

/// Token identifying this agent in status-update requests.
const CLIENT_TOKEN: &str = "fota-agent";

struct ReporterInner {
    record: ExecutionRecord,
    /// Latched by the first terminal report; later terminal calls are
    /// publish-free no-ops.
    terminal: bool,
    /// Set once the echo subscription has been released.
    released: bool,
}

/// Reports one job's execution status to the job service.
pub struct JobReporter {
    transport: Arc<dyn Transport>,
    update_topic: String,
    accepted_topic: String,
    echo_filter: String,
    progress_topic: String,
    publish_timeout: Duration,
    inner: Arc<Mutex<ReporterInner>>,
}

impl JobReporter {
    pub fn new(
        transport: Arc<dyn Transport>,
        topics: &TopicScheme,
        record: ExecutionRecord,
        publish_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            update_topic: topics.update(&record.job_id),
            accepted_topic: topics.update_accepted(&record.job_id),
            echo_filter: topics.update_accepted_filter(),
            progress_topic: topics.progress(&record.job_id),
            publish_timeout,
            inner: Arc::new(Mutex::new(ReporterInner {
                record,
                terminal: false,
                released: false,
            })),
        }
    }

    pub fn job_id(&self) -> String {
        self.inner.lock().unwrap().record.job_id.clone()
    }

    /// Snapshot of the record, for logging and tests.
    pub fn record(&self) -> ExecutionRecord {
        self.inner.lock().unwrap().record.clone()
    }

    /// Subscribes the accepted-update echo and starts resynchronizing the
    /// version counter from it.
    pub async fn bind(&self) -> Result<(), TransportError> {
        let inner = Arc::clone(&self.inner);
        let accepted_topic = self.accepted_topic.clone();

        let handler: MessageHandler = Arc::new(move |msg: InboundMessage| {
            // The filter is a wildcard over all of the thing's jobs; only
            // this job's echoes concern this reporter.
            if msg.topic != accepted_topic {
                return;
            }
            let payload: EchoPayload = match serde_json::from_slice(&msg.payload) {
                Ok(payload) => payload,
                Err(e) => {
                    debug!("undecodable echo on {}: {}", msg.topic, e);
                    return;
                }
            };
            let Some(state) = payload.execution_state else {
                return;
            };
            let mut inner = inner.lock().unwrap();
            if inner.released {
                return;
            }
            debug!(
                "job {}: version resynced {} -> {}",
                inner.record.job_id, inner.record.version_number, state.version_number
            );
            inner.record.version_number = state.version_number;
            inner.record.status_details = state.status_details;
        });

        self.transport
            .subscribe(&self.echo_filter, QosLevel::AtMostOnce, handler)
            .await
    }

    /// Reports the job in progress with the given details.
    ///
    /// Returns the transport error if the publish is not acknowledged
    /// within the publish timeout; the caller decides what to do next; no
    /// retry happens here.
    pub async fn in_progress(&self, details: StatusDetails) -> Result<(), TransportError> {
        let payload = {
            let mut inner = self.inner.lock().unwrap();
            if inner.terminal {
                return Ok(());
            }
            inner.record.status = JobStatus::InProgress;
            inner.record.status_details = details;
            info!(
                "job {} IN_PROGRESS: {:?}",
                inner.record.job_id, inner.record.status_details
            );
            encode_update(&inner.record)?
        };
        self.send_update(payload).await
    }

    /// Reports successful completion and releases the echo subscription.
    pub async fn success(&self, details: StatusDetails) -> Result<(), TransportError> {
        self.finalize(JobStatus::Succeeded, details).await
    }

    /// Reports a failed execution and releases the echo subscription.
    pub async fn fail(&self, err: JobError) -> Result<(), TransportError> {
        self.finalize(JobStatus::Failed, error_details(&err)).await
    }

    /// Reports that the job could not be handled (bad document) and
    /// releases the echo subscription.
    pub async fn reject(&self, err: JobError) -> Result<(), TransportError> {
        self.finalize(JobStatus::Rejected, error_details(&err)).await
    }

    /// Releases the echo subscription without publishing anything. Used
    /// when the process is about to exit, e.g. right after triggering a
    /// reboot.
    pub async fn terminate(&self) {
        self.release().await;
    }

    /// Relays a free-form progress line to the monitoring topic.
    ///
    /// Best-effort and distinct from the authoritative status protocol:
    /// failures are logged, never escalated.
    pub async fn publish_progress(&self, text: &str) {
        let payload = ProgressPayload {
            progress: text.to_string(),
            ts: chrono::Utc::now().timestamp(),
        };
        let Ok(bytes) = serde_json::to_vec(&payload) else {
            return;
        };
        if let Err(e) = self
            .transport
            .publish(&self.progress_topic, QosLevel::AtMostOnce, false, bytes)
            .await
        {
            debug!("progress relay failed: {}", e);
        }
    }

    async fn finalize(
        &self,
        status: JobStatus,
        details: StatusDetails,
    ) -> Result<(), TransportError> {
        let payload = {
            let mut inner = self.inner.lock().unwrap();
            if inner.terminal {
                debug!(
                    "job {} already terminal, ignoring {:?} report",
                    inner.record.job_id, status
                );
                return Ok(());
            }
            inner.terminal = true;
            inner.record.status = status;
            inner.record.status_details = details;
            info!(
                "job {} {:?}: {:?}",
                inner.record.job_id, status, inner.record.status_details
            );
            encode_update(&inner.record)?
        };

        let result = self.send_update(payload).await;
        // A stuck terminal publish leaves the job in its last reported
        // state service-side; the subscription is released either way.
        self.release().await;
        result
    }

    async fn send_update(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        let publish = self.transport.publish(
            &self.update_topic,
            QosLevel::AtLeastOnce,
            false,
            payload,
        );
        match tokio::time::timeout(self.publish_timeout, publish).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::PublishTimeout(self.publish_timeout)),
        }
    }

    async fn release(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.released {
                return;
            }
            inner.released = true;
        }
        if let Err(e) = self.transport.unsubscribe(&self.echo_filter).await {
            warn!("failed to release echo subscription: {}", e);
        }
    }
}

fn error_details(err: &JobError) -> StatusDetails {
    let mut details = StatusDetails::new();
    details.insert("error".to_string(), err.to_string());
    details
}

fn encode_update(record: &ExecutionRecord) -> Result<Vec<u8>, TransportError> {
    serde_json::to_vec(&StatusUpdatePayload::from_record(record, CLIENT_TOKEN))
        .map_err(|e| TransportError::Publish(format!("failed to encode status update: {e}")))
}
