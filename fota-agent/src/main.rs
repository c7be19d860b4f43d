//! FOTA Agent
//!
//! A device-side agent that executes firmware-update jobs dispatched by a
//! cloud job-queueing service over MQTT.
//!
//! Architecture:
//! - Configuration: defaults, optional JSON config file, CLI/env overrides
//! - Transport: one shared MQTT connection behind the `Transport` trait
//! - Dispatcher: decodes job notifications, spawns one session per job
//! - Reporter: owns a job's execution record, keeps its version counter
//!   synchronized with the service
//! - Session: the install/commit/rollback state machine, resuming from the
//!   last reported step after a reboot
//!
//! The agent keeps no local state: when a reboot interrupts an update, the
//! `start-next` request issued at startup redelivers the pending job and
//! the session resumes from the step the service last recorded.

mod config;
mod dispatcher;
mod reboot;
mod reporter;
mod session;
#[cfg(test)]
mod support;
mod updater;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{AgentConfig, Overrides};
use crate::dispatcher::Dispatcher;
use crate::reboot::{RebootTrigger, SystemReboot};
use crate::updater::{CommandUpdater, Updater};
use fota_transport::{MqttTransport, Transport};

#[derive(Parser)]
#[command(name = "fota-agent")]
#[command(about = "Firmware update job agent", long_about = None)]
struct Cli {
    /// JSON configuration file; inline flags override its settings
    #[arg(long, env = "FOTA_CONFIG", default_value = "/etc/fota/agent.conf")]
    config: PathBuf,

    /// Broker endpoint hostname
    #[arg(long, env = "FOTA_ENDPOINT")]
    endpoint: Option<String>,

    /// Broker port
    #[arg(long, env = "FOTA_PORT")]
    port: Option<u16>,

    /// CA certificate path
    #[arg(long, env = "FOTA_CA_CERT")]
    cacert: Option<PathBuf>,

    /// Device certificate path
    #[arg(long, env = "FOTA_CERT")]
    cert: Option<PathBuf>,

    /// Private key path
    #[arg(long, env = "FOTA_KEY")]
    key: Option<PathBuf>,

    /// Cloud-side identity of this device
    #[arg(long, env = "FOTA_THING_ID")]
    thing_id: Option<String>,

    /// MQTT client id (defaults to the thing id)
    #[arg(long, env = "FOTA_CLIENT_ID")]
    client_id: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fota_agent=info,fota_transport=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    info!(
        "starting fota-agent for thing {} against {}:{}",
        config.thing_id, config.endpoint, config.port
    );

    let transport = Arc::new(
        MqttTransport::new(config.mqtt_settings())
            .context("failed to initialize the mqtt transport")?,
    );
    transport
        .connect()
        .await
        .context("failed to connect to the broker")?;
    info!("connected");

    let updater: Arc<dyn Updater> = Arc::new(CommandUpdater::new(config.updater_program.clone()));
    let rebooter: Arc<dyn RebootTrigger> = Arc::new(SystemReboot);

    let dispatcher = Dispatcher::new(
        Arc::clone(&transport) as Arc<dyn Transport>,
        Arc::new(config.topic_scheme()),
        updater,
        rebooter,
        config.publish_timeout,
        config.install_timeout,
    );
    dispatcher
        .start()
        .await
        .context("failed to subscribe job notifications")?;
    info!("agent started, waiting for jobs");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!("shutting down");
    dispatcher.stop().await;
    transport.shutdown().await;
    Ok(())
}

fn load_config(cli: &Cli) -> Result<AgentConfig> {
    let mut config = AgentConfig::default();

    match config.apply_file(&cli.config)? {
        true => info!("loaded configuration from {}", cli.config.display()),
        false => info!("no config file at {}, using defaults", cli.config.display()),
    }

    config.apply_overrides(Overrides {
        endpoint: cli.endpoint.clone(),
        port: cli.port,
        thing_id: cli.thing_id.clone(),
        client_id: cli.client_id.clone(),
        ca_cert: cli.cacert.clone(),
        certificate: cli.cert.clone(),
        private_key: cli.key.clone(),
    });
    config.finalize();
    config.validate()?;
    Ok(config)
}
