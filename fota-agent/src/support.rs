//! Test doubles shared by the agent's unit tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use fota_core::{ExecutionRecord, JobStatus, StatusDetails, TopicScheme};
use fota_transport::{
    InboundMessage, MessageHandler, QosLevel, Transport, TransportError, filter_matches,
};

use crate::reboot::{RebootError, RebootTrigger};
use crate::updater::{InstallHandle, UpdateError, Updater};

pub fn scheme() -> TopicScheme {
    TopicScheme::new("$aws", "monitor", "device-1")
}

pub fn record(job_id: &str, version: i64) -> ExecutionRecord {
    ExecutionRecord {
        job_id: job_id.to_string(),
        thing_id: "device-1".to_string(),
        status: JobStatus::Queued,
        status_details: StatusDetails::new(),
        version_number: version,
        execution_number: 1,
    }
}

#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub topic: String,
    pub qos: QosLevel,
    #[allow(dead_code)]
    pub retain: bool,
    pub payload: Vec<u8>,
}

/// Transport double: records traffic and lets tests inject inbound
/// messages through the registered handlers.
#[derive(Default)]
pub struct RecordingTransport {
    published: Mutex<Vec<PublishedMessage>>,
    subscriptions: Mutex<Vec<(String, MessageHandler)>>,
    unsubscribed: Mutex<Vec<String>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().unwrap().clone()
    }

    pub fn subscribed_filters(&self) -> Vec<String> {
        self.subscriptions
            .lock()
            .unwrap()
            .iter()
            .map(|(filter, _)| filter.clone())
            .collect()
    }

    pub fn unsubscribed(&self) -> Vec<String> {
        self.unsubscribed.lock().unwrap().clone()
    }

    /// Invokes every handler whose filter matches `topic`, as the broker
    /// would.
    pub fn deliver(&self, topic: &str, payload: Vec<u8>) {
        let handlers: Vec<MessageHandler> = {
            let subs = self.subscriptions.lock().unwrap();
            subs.iter()
                .filter(|(filter, _)| filter_matches(filter, topic))
                .map(|(_, handler)| Arc::clone(handler))
                .collect()
        };
        for handler in handlers {
            handler(InboundMessage {
                topic: topic.to_string(),
                payload: payload.clone(),
            });
        }
    }

    /// Decoded status updates published for `job_id`, oldest first.
    pub fn job_updates(&self, job_id: &str) -> Vec<serde_json::Value> {
        let topic = format!("$aws/things/device-1/jobs/{job_id}/update");
        self.published()
            .iter()
            .filter(|m| m.topic == topic)
            .map(|m| serde_json::from_slice(&m.payload).expect("status update is json"))
            .collect()
    }

    /// Progress texts relayed to the monitoring topic for `job_id`.
    pub fn progress_lines(&self, job_id: &str) -> Vec<String> {
        let topic = format!("monitor/device-1/job/{job_id}/progress");
        self.published()
            .iter()
            .filter(|m| m.topic == topic)
            .map(|m| {
                let value: serde_json::Value =
                    serde_json::from_slice(&m.payload).expect("progress payload is json");
                value["progress"].as_str().expect("progress is text").to_string()
            })
            .collect()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        qos: QosLevel,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        self.published.lock().unwrap().push(PublishedMessage {
            topic: topic.to_string(),
            qos,
            retain,
            payload,
        });
        Ok(())
    }

    async fn subscribe(
        &self,
        filter: &str,
        _qos: QosLevel,
        handler: MessageHandler,
    ) -> Result<(), TransportError> {
        self.subscriptions
            .lock()
            .unwrap()
            .push((filter.to_string(), handler));
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError> {
        let mut subs = self.subscriptions.lock().unwrap();
        if let Some(idx) = subs.iter().position(|(f, _)| f == filter) {
            subs.remove(idx);
        }
        self.unsubscribed.lock().unwrap().push(filter.to_string());
        Ok(())
    }
}

/// How a scripted install should behave.
#[derive(Debug, Clone)]
pub enum InstallScript {
    /// Emit the lines, then finish successfully.
    Succeed { lines: Vec<String> },
    /// Finish with an install error.
    Fail { message: String },
    /// Never finish; only an abort (or the test ending) stops it.
    Hang,
}

/// Updater double with scripted behavior and call counting.
pub struct ScriptedUpdater {
    install_script: InstallScript,
    commit_ok: bool,
    rollback_ok: bool,
    install_calls: AtomicUsize,
    commit_calls: AtomicUsize,
    rollback_calls: AtomicUsize,
    install_urls: Mutex<Vec<String>>,
}

impl ScriptedUpdater {
    pub fn happy() -> Self {
        Self::with_install(InstallScript::Succeed { lines: Vec::new() })
    }

    pub fn with_install(install_script: InstallScript) -> Self {
        Self {
            install_script,
            commit_ok: true,
            rollback_ok: true,
            install_calls: AtomicUsize::new(0),
            commit_calls: AtomicUsize::new(0),
            rollback_calls: AtomicUsize::new(0),
            install_urls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_commit() -> Self {
        Self {
            commit_ok: false,
            ..Self::happy()
        }
    }

    pub fn failing_rollback() -> Self {
        Self {
            rollback_ok: false,
            ..Self::happy()
        }
    }

    pub fn install_calls(&self) -> usize {
        self.install_calls.load(Ordering::SeqCst)
    }

    pub fn commit_calls(&self) -> usize {
        self.commit_calls.load(Ordering::SeqCst)
    }

    pub fn rollback_calls(&self) -> usize {
        self.rollback_calls.load(Ordering::SeqCst)
    }

    pub fn install_urls(&self) -> Vec<String> {
        self.install_urls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Updater for ScriptedUpdater {
    fn install(&self, url: &str) -> InstallHandle {
        self.install_calls.fetch_add(1, Ordering::SeqCst);
        self.install_urls.lock().unwrap().push(url.to_string());

        let script = self.install_script.clone();
        let (progress_tx, progress_rx) = tokio::sync::mpsc::channel(32);
        let (result_tx, result_rx) = tokio::sync::oneshot::channel();

        let task = tokio::spawn(async move {
            match script {
                InstallScript::Succeed { lines } => {
                    for line in lines {
                        let _ = progress_tx.send(line).await;
                    }
                    // let the session drain the lines before finishing
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    let _ = result_tx.send(Ok(()));
                }
                InstallScript::Fail { message } => {
                    let _ = result_tx.send(Err(UpdateError::Other(message)));
                }
                InstallScript::Hang => {
                    std::future::pending::<()>().await;
                }
            }
        });

        InstallHandle::new(progress_rx, result_rx, task)
    }

    async fn commit(&self) -> Result<(), UpdateError> {
        self.commit_calls.fetch_add(1, Ordering::SeqCst);
        if self.commit_ok {
            Ok(())
        } else {
            Err(UpdateError::Other("commit refused".to_string()))
        }
    }

    async fn rollback(&self) -> Result<(), UpdateError> {
        self.rollback_calls.fetch_add(1, Ordering::SeqCst);
        if self.rollback_ok {
            Ok(())
        } else {
            Err(UpdateError::Other("rollback refused".to_string()))
        }
    }
}

/// Reboot double counting invocations.
pub struct CountingReboot {
    ok: bool,
    calls: AtomicUsize,
}

impl CountingReboot {
    pub fn ok() -> Self {
        Self {
            ok: true,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            ok: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RebootTrigger for CountingReboot {
    async fn reboot(&self) -> Result<(), RebootError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.ok {
            Ok(())
        } else {
            Err(RebootError("reboot refused".to_string()))
        }
    }
}
