//! MQTT binding
//!
//! Production [`Transport`] implementation over rumqttc. One long-lived
//! connection is shared by every job session; a driver task polls the
//! event loop, dispatches inbound publishes to the matching handlers and
//! replays subscriptions after a reconnect.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, TlsConfiguration};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::filter::filter_matches;
use crate::{InboundMessage, MessageHandler, QosLevel, Transport};

/// PEM files establishing the device identity towards the broker.
#[derive(Debug, Clone)]
pub struct TlsFiles {
    pub ca_cert: PathBuf,
    pub client_cert: PathBuf,
    pub private_key: PathBuf,
}

/// Connection settings for the MQTT binding.
#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub endpoint: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    /// Mutual TLS; `None` connects in plaintext (local brokers, tests).
    pub tls: Option<TlsFiles>,
}

struct Subscription {
    filter: String,
    qos: QosLevel,
    handler: MessageHandler,
}

/// MQTT-backed transport.
///
/// Reconnection is handled below this boundary: rumqttc re-establishes the
/// session on the next event-loop poll, and the driver re-subscribes every
/// registered filter when the new connection is acknowledged.
pub struct MqttTransport {
    client: AsyncClient,
    subscriptions: Arc<Mutex<Vec<Subscription>>>,
    connected: watch::Receiver<bool>,
    connect_timeout: Duration,
    driver: tokio::task::JoinHandle<()>,
}

impl MqttTransport {
    /// Builds the client and spawns the event-loop driver.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(settings: MqttSettings) -> Result<Self, TransportError> {
        let mut options = MqttOptions::new(
            settings.client_id.clone(),
            settings.endpoint.clone(),
            settings.port,
        );
        options.set_keep_alive(settings.keep_alive);

        if let Some(tls) = &settings.tls {
            let ca = std::fs::read(&tls.ca_cert)?;
            let client_cert = std::fs::read(&tls.client_cert)?;
            let private_key = std::fs::read(&tls.private_key)?;
            options.set_transport(rumqttc::Transport::Tls(TlsConfiguration::Simple {
                ca,
                alpn: None,
                client_auth: Some((client_cert, private_key)),
            }));
        }

        let (client, event_loop) = AsyncClient::new(options, 16);
        let subscriptions = Arc::new(Mutex::new(Vec::new()));
        let (connected_tx, connected_rx) = watch::channel(false);

        let driver = tokio::spawn(drive(
            event_loop,
            client.clone(),
            Arc::clone(&subscriptions),
            connected_tx,
        ));

        Ok(Self {
            client,
            subscriptions,
            connected: connected_rx,
            connect_timeout: settings.connect_timeout,
            driver,
        })
    }

    /// Tears the connection down and stops the driver task.
    pub async fn shutdown(&self) {
        if let Err(e) = self.client.disconnect().await {
            debug!("disconnect while shutting down: {}", e);
        }
        self.driver.abort();
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let mut connected = self.connected.clone();
        if *connected.borrow() {
            return Ok(());
        }

        let wait = async {
            while connected.changed().await.is_ok() {
                if *connected.borrow() {
                    return Ok(());
                }
            }
            Err(TransportError::NotConnected)
        };

        tokio::time::timeout(self.connect_timeout, wait)
            .await
            .map_err(|_| TransportError::ConnectTimeout(self.connect_timeout))?
    }

    async fn publish(
        &self,
        topic: &str,
        qos: QosLevel,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        self.client
            .publish(topic, qos.into(), retain, payload)
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))
    }

    async fn subscribe(
        &self,
        filter: &str,
        qos: QosLevel,
        handler: MessageHandler,
    ) -> Result<(), TransportError> {
        {
            let mut subs = self.subscriptions.lock().unwrap();
            subs.push(Subscription {
                filter: filter.to_string(),
                qos,
                handler,
            });
        }
        self.client
            .subscribe(filter, qos.into())
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError> {
        let last_for_filter = {
            let mut subs = self.subscriptions.lock().unwrap();
            if let Some(idx) = subs.iter().position(|s| s.filter == filter) {
                subs.remove(idx);
            }
            !subs.iter().any(|s| s.filter == filter)
        };

        // Other sessions may still rely on the same filter.
        if !last_for_filter {
            return Ok(());
        }

        self.client
            .unsubscribe(filter)
            .await
            .map_err(|e| TransportError::Unsubscribe(e.to_string()))
    }
}

/// Event-loop driver: dispatches publishes, tracks connection state,
/// replays subscriptions on reconnect.
async fn drive(
    mut event_loop: EventLoop,
    client: AsyncClient,
    subscriptions: Arc<Mutex<Vec<Subscription>>>,
    connected: watch::Sender<bool>,
) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connection established");
                let _ = connected.send(true);

                let filters: Vec<(String, QosLevel)> = {
                    let subs = subscriptions.lock().unwrap();
                    subs.iter().map(|s| (s.filter.clone(), s.qos)).collect()
                };
                for (filter, qos) in filters {
                    // try_subscribe: awaiting the client here would starve
                    // the event loop we are driving
                    if let Err(e) = client.try_subscribe(filter.as_str(), qos.into()) {
                        warn!("failed to replay subscription {}: {}", filter, e);
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = InboundMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                };
                let handlers: Vec<MessageHandler> = {
                    let subs = subscriptions.lock().unwrap();
                    subs.iter()
                        .filter(|s| filter_matches(&s.filter, &message.topic))
                        .map(|s| Arc::clone(&s.handler))
                        .collect()
                };
                if handlers.is_empty() {
                    debug!("no handler for message on {}", message.topic);
                }
                for handler in handlers {
                    handler(message.clone());
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!("mqtt connection error: {}", e);
                let _ = connected.send(false);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

impl From<QosLevel> for rumqttc::QoS {
    fn from(qos: QosLevel) -> Self {
        match qos {
            QosLevel::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QosLevel::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        }
    }
}
