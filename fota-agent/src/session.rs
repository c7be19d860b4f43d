//! Update orchestrator
//!
//! One session per job. The session interprets the job's operation together
//! with the last *reported* step and decides whether to start an install,
//! commit after a reboot, or roll back. The persisted step is the only
//! memory that survives a mid-update reboot: the service redelivers the job
//! with the step it last recorded, and the session picks up from there.
//!
//! All status transitions go through the owning [`JobReporter`]; the
//! session never touches the execution record directly.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use fota_core::{JobError, Operation, Step, codes};

use crate::reboot::RebootTrigger;
use crate::reporter::JobReporter;
use crate::updater::Updater;

/// State machine instance driving one job execution.
pub struct UpdateSession {
    reporter: Arc<JobReporter>,
    updater: Arc<dyn Updater>,
    rebooter: Arc<dyn RebootTrigger>,
    install_timeout: Duration,
}

impl UpdateSession {
    pub fn new(
        reporter: Arc<JobReporter>,
        updater: Arc<dyn Updater>,
        rebooter: Arc<dyn RebootTrigger>,
        install_timeout: Duration,
    ) -> Self {
        Self {
            reporter,
            updater,
            rebooter,
            install_timeout,
        }
    }

    /// Executes the job to a terminal state (or to the reboot that ends
    /// this process).
    ///
    /// A descriptor that failed validation is rejected here, so the
    /// updater is never invoked for a document the agent cannot execute.
    pub async fn run(&self, operation: Result<Operation, JobError>, step: Step) {
        let operation = match operation {
            Ok(operation) => operation,
            Err(err) => {
                warn!("rejecting job {}: {}", self.reporter.job_id(), err);
                if let Err(e) = self.reporter.reject(err).await {
                    error!("failed to report rejection: {}", e);
                }
                return;
            }
        };

        match operation {
            Operation::Install { url } => match step {
                // back up after the reboot a completed install triggered
                Step::Rebooting => self.commit_installed().await,
                _ => self.fresh_install(&url).await,
            },
            Operation::Rollback => self.rollback().await,
        }
    }

    async fn fresh_install(&self, url: &str) {
        let job_id = self.reporter.job_id();
        info!("job {}: installing from {}", job_id, url);

        if let Err(e) = self.reporter.in_progress(Step::Installing.details()).await {
            // the service will redeliver if it never saw the step; keep going
            warn!("job {}: failed to report install start: {}", job_id, e);
        }

        let mut handle = self.updater.install(url);
        let deadline = tokio::time::sleep(self.install_timeout);
        tokio::pin!(deadline);
        let mut progress_open = true;

        loop {
            tokio::select! {
                line = handle.progress.recv(), if progress_open => {
                    match line {
                        Some(line) => {
                            debug!("job {}: {}", job_id, line);
                            if let Err(e) =
                                self.reporter.in_progress(Step::Installing.details()).await
                            {
                                warn!("job {}: progress report failed: {}", job_id, e);
                            }
                            // the literal tool output goes to the
                            // monitoring channel, not the step field
                            self.reporter.publish_progress(&line).await;
                        }
                        None => progress_open = false,
                    }
                }
                result = &mut handle.result => {
                    match result {
                        Ok(Ok(())) => self.enter_reboot().await,
                        Ok(Err(err)) => {
                            error!("job {}: install failed: {}", job_id, err);
                            self.fail(JobError::new(codes::INSTALL_FAILED, err.to_string()))
                                .await;
                        }
                        Err(_) => {
                            error!("job {}: install ended without a result", job_id);
                            self.fail(JobError::new(
                                codes::INSTALL_FAILED,
                                "install stopped unexpectedly",
                            ))
                            .await;
                        }
                    }
                    return;
                }
                () = &mut deadline => {
                    warn!(
                        "job {}: install exceeded {:?}, aborting",
                        job_id, self.install_timeout
                    );
                    // stop the updater so it cannot report into a job
                    // already marked failed
                    handle.abort();
                    self.fail(JobError::new(codes::INSTALL_TIMEOUT, "install timed out"))
                        .await;
                    return;
                }
            }
        }
    }

    /// Install finished: persist the `rebooting` step, restart the device
    /// and end this session. The process is expected to be torn down by
    /// the reboot; the job is finalized by the post-reboot session.
    async fn enter_reboot(&self) {
        let job_id = self.reporter.job_id();

        if let Err(e) = self.reporter.in_progress(Step::Rebooting.details()).await {
            // if this report is lost the service redelivers with the stale
            // step and the install runs again; inherent to the protocol
            warn!("job {}: failed to report rebooting step: {}", job_id, e);
        }

        match self.rebooter.reboot().await {
            Ok(()) => {
                info!("job {}: reboot triggered, ending session", job_id);
                self.reporter.terminate().await;
            }
            Err(e) => {
                error!("job {}: unable to reboot: {}", job_id, e);
                self.fail(JobError::new(codes::REBOOT_FAILED, e.to_string()))
                    .await;
            }
        }
    }

    /// Back up after the reboot: the freshly installed image is running,
    /// make it permanent.
    async fn commit_installed(&self) {
        let job_id = self.reporter.job_id();
        info!("job {}: back after reboot, committing", job_id);

        if let Err(e) = self.reporter.in_progress(Step::Rebooted.details()).await {
            warn!("job {}: failed to report rebooted step: {}", job_id, e);
        }

        match self.updater.commit().await {
            Ok(()) => {
                if let Err(e) = self.reporter.success(Step::Committed.details()).await {
                    error!("job {}: failed to report success: {}", job_id, e);
                }
            }
            Err(err) => {
                // a failed commit means the bootloader already fell back
                // to the previous image; no rollback is issued here
                error!("job {}: commit failed: {}", job_id, err);
                self.fail(JobError::new(codes::COMMIT_FAILED, err.to_string()))
                    .await;
            }
        }
    }

    async fn rollback(&self) {
        let job_id = self.reporter.job_id();
        info!("job {}: rolling back", job_id);

        match self.updater.rollback().await {
            Ok(()) => {
                if let Err(e) = self.reporter.success(Step::RolledBack.details()).await {
                    error!("job {}: failed to report success: {}", job_id, e);
                }
            }
            Err(err) => {
                error!("job {}: rollback failed: {}", job_id, err);
                self.fail(JobError::new(codes::ROLLBACK_FAILED, err.to_string()))
                    .await;
            }
        }
    }

    async fn fail(&self, err: JobError) {
        if let Err(e) = self.reporter.fail(err).await {
            error!(
                "job {}: failed to report failure: {}",
                self.reporter.job_id(),
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::support::{
        CountingReboot, InstallScript, RecordingTransport, ScriptedUpdater, record, scheme,
    };
    use fota_core::job::JobDocument;
    use fota_transport::Transport;

    struct Fixture {
        transport: Arc<RecordingTransport>,
        updater: Arc<ScriptedUpdater>,
        rebooter: Arc<CountingReboot>,
        session: UpdateSession,
    }

    fn fixture(updater: ScriptedUpdater) -> Fixture {
        let transport = Arc::new(RecordingTransport::new());
        let updater = Arc::new(updater);
        let rebooter = Arc::new(CountingReboot::ok());
        let reporter = Arc::new(JobReporter::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            &scheme(),
            record("j1", 1),
            Duration::from_secs(2),
        ));
        let session = UpdateSession::new(
            reporter,
            Arc::clone(&updater) as Arc<dyn Updater>,
            Arc::clone(&rebooter) as Arc<dyn RebootTrigger>,
            Duration::from_secs(600),
        );
        Fixture {
            transport,
            updater,
            rebooter,
            session,
        }
    }

    fn install_op(url: &str) -> Result<Operation, JobError> {
        Ok(Operation::Install {
            url: url.to_string(),
        })
    }

    #[tokio::test]
    async fn test_invalid_document_is_rejected_without_touching_updater() {
        let f = fixture(ScriptedUpdater::happy());
        let bad = Operation::from_document(&JobDocument {
            operation: "reformat".to_string(),
            url: None,
        });

        f.session.run(bad, Step::Fresh).await;

        let updates = f.transport.job_updates("j1");
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0]["status"], "REJECTED");
        assert!(
            updates[0]["statusDetails"]["error"]
                .as_str()
                .unwrap()
                .contains(codes::INVALID_OPERATION)
        );
        assert_eq!(f.updater.install_calls(), 0);
        assert_eq!(f.updater.commit_calls(), 0);
        assert_eq!(f.updater.rollback_calls(), 0);
    }

    #[tokio::test]
    async fn test_install_without_url_is_rejected_with_missing_url() {
        let f = fixture(ScriptedUpdater::happy());
        let bad = Operation::from_document(&JobDocument {
            operation: "install".to_string(),
            url: None,
        });

        f.session.run(bad, Step::Fresh).await;

        let updates = f.transport.job_updates("j1");
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0]["status"], "REJECTED");
        assert!(
            updates[0]["statusDetails"]["error"]
                .as_str()
                .unwrap()
                .contains(codes::MISSING_URL)
        );
        assert_eq!(f.updater.install_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_install_runs_to_reboot() {
        let f = fixture(ScriptedUpdater::with_install(InstallScript::Succeed {
            lines: vec!["downloading".to_string(), "writing".to_string()],
        }));

        f.session.run(install_op("https://x/fw.pkg"), Step::Fresh).await;

        assert_eq!(f.updater.install_calls(), 1);
        assert_eq!(f.updater.install_urls(), vec!["https://x/fw.pkg"]);
        assert_eq!(f.updater.commit_calls(), 0);
        assert_eq!(f.rebooter.calls(), 1);

        let updates = f.transport.job_updates("j1");
        assert_eq!(updates[0]["status"], "IN_PROGRESS");
        assert_eq!(updates[0]["statusDetails"]["step"], "installing");
        let last = updates.last().unwrap();
        assert_eq!(last["status"], "IN_PROGRESS");
        assert_eq!(last["statusDetails"]["step"], "rebooting");
        // no terminal report: the post-reboot session finalizes the job
        assert!(updates.iter().all(|u| u["status"] == "IN_PROGRESS"));

        // literal tool output went to the monitoring channel
        let progress = f.transport.progress_lines("j1");
        assert_eq!(progress, vec!["downloading", "writing"]);

        // reporter released without publishing a terminal state
        assert_eq!(f.transport.unsubscribed().len(), 1);
    }

    #[tokio::test]
    async fn test_resume_after_reboot_commits_and_never_installs() {
        let f = fixture(ScriptedUpdater::happy());

        f.session
            .run(install_op("https://x/fw.pkg"), Step::Rebooting)
            .await;

        assert_eq!(f.updater.commit_calls(), 1);
        assert_eq!(f.updater.install_calls(), 0);

        let updates = f.transport.job_updates("j1");
        assert_eq!(updates[0]["status"], "IN_PROGRESS");
        assert_eq!(updates[0]["statusDetails"]["step"], "rebooted");
        let last = updates.last().unwrap();
        assert_eq!(last["status"], "SUCCEEDED");
        assert_eq!(last["statusDetails"]["step"], "committed");
    }

    #[tokio::test]
    async fn test_commit_failure_fails_without_rollback() {
        let f = fixture(ScriptedUpdater::failing_commit());

        f.session
            .run(install_op("https://x/fw.pkg"), Step::Rebooting)
            .await;

        assert_eq!(f.updater.rollback_calls(), 0);
        let last = f.transport.job_updates("j1").pop().unwrap();
        assert_eq!(last["status"], "FAILED");
        assert!(
            last["statusDetails"]["error"]
                .as_str()
                .unwrap()
                .contains(codes::COMMIT_FAILED)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_install_error_fails_once_without_reboot() {
        let f = fixture(ScriptedUpdater::with_install(InstallScript::Fail {
            message: "no space left".to_string(),
        }));

        f.session.run(install_op("https://x/fw.pkg"), Step::Fresh).await;

        assert_eq!(f.rebooter.calls(), 0);
        let updates = f.transport.job_updates("j1");
        let failed: Vec<_> = updates.iter().filter(|u| u["status"] == "FAILED").collect();
        assert_eq!(failed.len(), 1);
        assert!(
            failed[0]["statusDetails"]["error"]
                .as_str()
                .unwrap()
                .contains(codes::INSTALL_FAILED)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_install_deadline_fails_once_and_aborts_the_install() {
        let f = fixture(ScriptedUpdater::with_install(InstallScript::Hang));

        f.session.run(install_op("https://x/fw.pkg"), Step::Fresh).await;

        let updates = f.transport.job_updates("j1");
        let failed: Vec<_> = updates.iter().filter(|u| u["status"] == "FAILED").collect();
        assert_eq!(failed.len(), 1);
        assert!(
            failed[0]["statusDetails"]["error"]
                .as_str()
                .unwrap()
                .contains(codes::INSTALL_TIMEOUT)
        );
        assert_eq!(f.rebooter.calls(), 0);

        // a late updater event must not produce a second report
        let before = f.transport.published().len();
        tokio::time::advance(Duration::from_secs(3600)).await;
        tokio::task::yield_now().await;
        assert_eq!(f.transport.published().len(), before);
    }

    #[tokio::test]
    async fn test_rollback_success() {
        let f = fixture(ScriptedUpdater::happy());

        f.session.run(Ok(Operation::Rollback), Step::Fresh).await;

        assert_eq!(f.updater.rollback_calls(), 1);
        let last = f.transport.job_updates("j1").pop().unwrap();
        assert_eq!(last["status"], "SUCCEEDED");
        assert_eq!(last["statusDetails"]["step"], "rolled_back");
    }

    #[tokio::test]
    async fn test_rollback_failure_is_reported() {
        let f = fixture(ScriptedUpdater::failing_rollback());

        f.session.run(Ok(Operation::Rollback), Step::Fresh).await;

        let last = f.transport.job_updates("j1").pop().unwrap();
        assert_eq!(last["status"], "FAILED");
        assert!(
            last["statusDetails"]["error"]
                .as_str()
                .unwrap()
                .contains(codes::ROLLBACK_FAILED)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_reboot_trigger_fails_the_job() {
        let transport = Arc::new(RecordingTransport::new());
        let updater = Arc::new(ScriptedUpdater::with_install(InstallScript::Succeed {
            lines: vec![],
        }));
        let rebooter = Arc::new(CountingReboot::failing());
        let reporter = Arc::new(JobReporter::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            &scheme(),
            record("j1", 1),
            Duration::from_secs(2),
        ));
        let session = UpdateSession::new(
            reporter,
            Arc::clone(&updater) as Arc<dyn Updater>,
            Arc::clone(&rebooter) as Arc<dyn RebootTrigger>,
            Duration::from_secs(600),
        );

        session.run(install_op("https://x/fw.pkg"), Step::Fresh).await;

        assert_eq!(rebooter.calls(), 1);
        let last = transport.job_updates("j1").pop().unwrap();
        assert_eq!(last["status"], "FAILED");
        assert!(
            last["statusDetails"]["error"]
                .as_str()
                .unwrap()
                .contains(codes::REBOOT_FAILED)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_step_resumes_as_fresh_install() {
        // the resume decision only distinguishes "rebooting"; anything
        // else restarts the install
        let f = fixture(ScriptedUpdater::with_install(InstallScript::Succeed {
            lines: vec![],
        }));

        f.session
            .run(install_op("https://x/fw.pkg"), Step::Installing)
            .await;

        assert_eq!(f.updater.install_calls(), 1);
        assert_eq!(f.updater.commit_calls(), 0);
    }
}
