//! Job dispatcher
//!
//! Subscribes the job-notification topics, decodes incoming envelopes and
//! spawns one update session per job. Dispatch never blocks the transport
//! delivery path: the session runs in its own task while the handler
//! returns immediately.
//!
//! On startup the dispatcher publishes a `start-next` request; any job
//! left pending from before a reboot is redelivered through it, which is
//! how an interrupted update resumes.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use fota_core::envelope;
use fota_core::{DecodeError, Operation, Step, TopicScheme};
use fota_transport::{InboundMessage, MessageHandler, QosLevel, Transport, TransportError};

use crate::reboot::RebootTrigger;
use crate::reporter::JobReporter;
use crate::session::UpdateSession;
use crate::updater::Updater;

/// Everything a job session needs, cloned into each spawned task.
#[derive(Clone)]
struct JobContext {
    transport: Arc<dyn Transport>,
    topics: Arc<TopicScheme>,
    updater: Arc<dyn Updater>,
    rebooter: Arc<dyn RebootTrigger>,
    publish_timeout: Duration,
    install_timeout: Duration,
}

/// Routes job notifications to update sessions.
pub struct Dispatcher {
    ctx: JobContext,
}

impl Dispatcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        topics: Arc<TopicScheme>,
        updater: Arc<dyn Updater>,
        rebooter: Arc<dyn RebootTrigger>,
        publish_timeout: Duration,
        install_timeout: Duration,
    ) -> Self {
        Self {
            ctx: JobContext {
                transport,
                topics,
                updater,
                rebooter,
                publish_timeout,
                install_timeout,
            },
        }
    }

    /// Subscribes the notification topics and asks the service for the
    /// next pending execution.
    pub async fn start(&self) -> Result<(), TransportError> {
        let topics = &self.ctx.topics;
        let job_handler = self.job_handler();

        for filter in [
            topics.notify_next(),
            topics.get_accepted_filter(),
            topics.start_next_accepted(),
        ] {
            self.ctx
                .transport
                .subscribe(&filter, QosLevel::AtMostOnce, Arc::clone(&job_handler))
                .await?;
        }

        let rejected_handler: MessageHandler = Arc::new(|msg: InboundMessage| {
            warn!(
                "request rejected on {}: {}",
                msg.topic,
                String::from_utf8_lossy(&msg.payload)
            );
        });
        for filter in [topics.get_rejected_filter(), topics.start_next_rejected()] {
            self.ctx
                .transport
                .subscribe(&filter, QosLevel::AtMostOnce, Arc::clone(&rejected_handler))
                .await?;
        }

        info!("checking for pending jobs");
        self.ctx
            .transport
            .publish(
                &topics.start_next(),
                QosLevel::AtLeastOnce,
                false,
                Vec::new(),
            )
            .await
    }

    /// Unsubscribes the notification topics.
    pub async fn stop(&self) {
        let topics = &self.ctx.topics;
        for filter in [
            topics.notify_next(),
            topics.get_accepted_filter(),
            topics.start_next_accepted(),
            topics.get_rejected_filter(),
            topics.start_next_rejected(),
        ] {
            if let Err(e) = self.ctx.transport.unsubscribe(&filter).await {
                warn!("failed to unsubscribe {}: {}", filter, e);
            }
        }
    }

    fn job_handler(&self) -> MessageHandler {
        let ctx = self.ctx.clone();
        Arc::new(move |msg: InboundMessage| {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                process_job_message(ctx, msg).await;
            });
        })
    }
}

/// Decodes one notification and, if it carries a job, runs it.
async fn process_job_message(ctx: JobContext, msg: InboundMessage) {
    let state = match envelope::decode_job(&msg.payload) {
        Ok(state) => state,
        Err(DecodeError::NotAJob) => {
            info!("message on {} is not a job - ignoring", msg.topic);
            return;
        }
        Err(err) => {
            warn!("dropping malformed payload on {}: {}", msg.topic, err);
            return;
        }
    };

    let job_id = state.job_id.clone();
    info!(
        "job {} delivered on {} (version {})",
        job_id, msg.topic, state.version_number
    );

    // validated eagerly; a bad document is rejected by the session with
    // the code carried in the error
    let operation = Operation::from_document(&state.job_document);
    let step = Step::from_details(&state.status_details);
    let record = state.into_record(ctx.topics.thing_id());

    let reporter = Arc::new(JobReporter::new(
        Arc::clone(&ctx.transport),
        &ctx.topics,
        record,
        ctx.publish_timeout,
    ));
    if let Err(e) = reporter.bind().await {
        error!("job {}: cannot subscribe status echoes: {}", job_id, e);
        return;
    }

    let session = UpdateSession::new(reporter, ctx.updater, ctx.rebooter, ctx.install_timeout);
    session.run(operation, step).await;
}
