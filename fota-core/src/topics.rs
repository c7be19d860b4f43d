//! Topic scheme
//!
//! All topic names the agent uses, templated on the jobs prefix, the
//! monitoring prefix and the thing id. Centralized so the reporter and the
//! dispatcher cannot drift apart on topic shapes.

/// Renders the topics for one thing's job traffic.
#[derive(Debug, Clone)]
pub struct TopicScheme {
    prefix: String,
    monitor_prefix: String,
    thing_id: String,
}

impl TopicScheme {
    pub fn new(
        prefix: impl Into<String>,
        monitor_prefix: impl Into<String>,
        thing_id: impl Into<String>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            monitor_prefix: monitor_prefix.into(),
            thing_id: thing_id.into(),
        }
    }

    pub fn thing_id(&self) -> &str {
        &self.thing_id
    }

    fn jobs(&self, leaf: &str) -> String {
        format!("{}/things/{}/jobs/{}", self.prefix, self.thing_id, leaf)
    }

    /// Status updates for one job are published here.
    pub fn update(&self, job_id: &str) -> String {
        self.jobs(&format!("{job_id}/update"))
    }

    /// Concrete topic an accepted update for `job_id` is echoed on.
    pub fn update_accepted(&self, job_id: &str) -> String {
        self.jobs(&format!("{job_id}/update/accepted"))
    }

    /// Wildcard filter covering accepted-update echoes for every job.
    pub fn update_accepted_filter(&self) -> String {
        self.jobs("+/update/accepted")
    }

    /// The service announces the next queued job here.
    pub fn notify_next(&self) -> String {
        self.jobs("notify-next")
    }

    pub fn get_accepted_filter(&self) -> String {
        self.jobs("+/get/accepted")
    }

    pub fn get_rejected_filter(&self) -> String {
        self.jobs("+/get/rejected")
    }

    /// Publishing here asks the service to start (or redeliver) the next
    /// pending execution, the resumption entry point after a reboot.
    pub fn start_next(&self) -> String {
        self.jobs("start-next")
    }

    pub fn start_next_accepted(&self) -> String {
        self.jobs("start-next/accepted")
    }

    pub fn start_next_rejected(&self) -> String {
        self.jobs("start-next/rejected")
    }

    /// Best-effort monitoring channel, outside the jobs namespace.
    pub fn progress(&self, job_id: &str) -> String {
        format!(
            "{}/{}/job/{}/progress",
            self.monitor_prefix, self.thing_id, job_id
        )
    }
}
