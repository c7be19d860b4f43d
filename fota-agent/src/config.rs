//! Agent configuration
//!
//! Three layers, last one wins: built-in defaults, an optional JSON config
//! file, then CLI flags / environment variables. The config file uses the
//! same camelCase keys as the wire payloads:
//!
//! ```json
//! {
//!     "endpoint": "broker.example.com",
//!     "port": 8883,
//!     "thingId": "device-1",
//!     "caCertPath": "rootCA.pem",
//!     "certificatePath": "cert.pem",
//!     "privateKeyPath": "private.key"
//! }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use fota_core::TopicScheme;
use fota_transport::{MqttSettings, TlsFiles};

/// Resolved agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Broker hostname.
    pub endpoint: String,
    pub port: u16,
    /// Cloud-side identity of this device.
    pub thing_id: String,
    /// MQTT client id; defaults to the thing id.
    pub client_id: String,
    pub ca_cert_path: PathBuf,
    pub certificate_path: PathBuf,
    pub private_key_path: PathBuf,
    /// Namespace of the job topics.
    pub topic_prefix: String,
    /// Namespace of the best-effort monitoring topics.
    pub monitor_prefix: String,
    /// Program implementing install/commit/rollback.
    pub updater_program: String,
    /// Bounded wait for a status publish to be acknowledged.
    pub publish_timeout: Duration,
    /// Hard deadline for one install run.
    pub install_timeout: Duration,
    pub connect_timeout: Duration,
    pub keep_alive: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            port: 8883,
            thing_id: String::new(),
            client_id: String::new(),
            ca_cert_path: PathBuf::from("rootCA.pem"),
            certificate_path: PathBuf::from("cert.pem"),
            private_key_path: PathBuf::from("private.key"),
            topic_prefix: "$aws".to_string(),
            monitor_prefix: "monitor".to_string(),
            updater_program: "mender".to_string(),
            publish_timeout: Duration::from_secs(2),
            install_timeout: Duration::from_secs(600),
            connect_timeout: Duration::from_secs(30),
            keep_alive: Duration::from_secs(30),
        }
    }
}

/// Partial overlay read from the JSON config file.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ConfigFile {
    endpoint: Option<String>,
    port: Option<u16>,
    thing_id: Option<String>,
    client_id: Option<String>,
    ca_cert_path: Option<PathBuf>,
    certificate_path: Option<PathBuf>,
    private_key_path: Option<PathBuf>,
    topic_prefix: Option<String>,
    monitor_prefix: Option<String>,
    updater_program: Option<String>,
    publish_timeout_secs: Option<u64>,
    install_timeout_secs: Option<u64>,
}

/// Values given on the command line or via environment variables; they
/// override the config file.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub endpoint: Option<String>,
    pub port: Option<u16>,
    pub thing_id: Option<String>,
    pub client_id: Option<String>,
    pub ca_cert: Option<PathBuf>,
    pub certificate: Option<PathBuf>,
    pub private_key: Option<PathBuf>,
}

impl AgentConfig {
    /// Merges the config file at `path` into this configuration.
    ///
    /// A missing file is not an error (the default path usually does not
    /// exist on development machines); an unparsable file is.
    pub fn apply_file(&mut self, path: &Path) -> anyhow::Result<bool> {
        let raw = match std::fs::read(path) {
            Ok(raw) => raw,
            Err(_) => return Ok(false),
        };
        let file: ConfigFile = serde_json::from_slice(&raw)
            .with_context(|| format!("invalid config file {}", path.display()))?;

        if let Some(v) = file.endpoint {
            self.endpoint = v;
        }
        if let Some(v) = file.port {
            self.port = v;
        }
        if let Some(v) = file.thing_id {
            self.thing_id = v;
        }
        if let Some(v) = file.client_id {
            self.client_id = v;
        }
        if let Some(v) = file.ca_cert_path {
            self.ca_cert_path = v;
        }
        if let Some(v) = file.certificate_path {
            self.certificate_path = v;
        }
        if let Some(v) = file.private_key_path {
            self.private_key_path = v;
        }
        if let Some(v) = file.topic_prefix {
            self.topic_prefix = v;
        }
        if let Some(v) = file.monitor_prefix {
            self.monitor_prefix = v;
        }
        if let Some(v) = file.updater_program {
            self.updater_program = v;
        }
        if let Some(v) = file.publish_timeout_secs {
            self.publish_timeout = Duration::from_secs(v);
        }
        if let Some(v) = file.install_timeout_secs {
            self.install_timeout = Duration::from_secs(v);
        }
        Ok(true)
    }

    /// Applies command-line/environment overrides.
    pub fn apply_overrides(&mut self, overrides: Overrides) {
        if let Some(v) = overrides.endpoint {
            self.endpoint = v;
        }
        if let Some(v) = overrides.port {
            self.port = v;
        }
        if let Some(v) = overrides.thing_id {
            self.thing_id = v;
        }
        if let Some(v) = overrides.client_id {
            self.client_id = v;
        }
        if let Some(v) = overrides.ca_cert {
            self.ca_cert_path = v;
        }
        if let Some(v) = overrides.certificate {
            self.certificate_path = v;
        }
        if let Some(v) = overrides.private_key {
            self.private_key_path = v;
        }
    }

    /// Fills derived defaults after all layers are merged.
    pub fn finalize(&mut self) {
        if self.client_id.is_empty() {
            self.client_id = if self.thing_id.is_empty() {
                uuid::Uuid::new_v4().to_string()
            } else {
                self.thing_id.clone()
            };
        }
    }

    /// Validates the merged configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.endpoint.is_empty() {
            anyhow::bail!("endpoint must be set");
        }
        if self.thing_id.is_empty() {
            anyhow::bail!("thing id must be set");
        }
        if self.port == 0 {
            anyhow::bail!("port must be greater than 0");
        }
        if self.publish_timeout.is_zero() {
            anyhow::bail!("publish timeout must be greater than 0");
        }
        if self.install_timeout.is_zero() {
            anyhow::bail!("install timeout must be greater than 0");
        }
        Ok(())
    }

    pub fn mqtt_settings(&self) -> MqttSettings {
        MqttSettings {
            endpoint: self.endpoint.clone(),
            port: self.port,
            client_id: self.client_id.clone(),
            keep_alive: self.keep_alive,
            connect_timeout: self.connect_timeout,
            tls: Some(TlsFiles {
                ca_cert: self.ca_cert_path.clone(),
                client_cert: self.certificate_path.clone(),
                private_key: self.private_key_path.clone(),
            }),
        }
    }

    pub fn topic_scheme(&self) -> TopicScheme {
        TopicScheme::new(&self.topic_prefix, &self.monitor_prefix, &self.thing_id)
    }
}
