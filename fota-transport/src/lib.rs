//! FOTA Transport
//!
//! The publish/subscribe boundary of the agent.
//!
//! This crate provides:
//! - The [`Transport`] trait every component talks to: publish, subscribe
//!   with a handler, unsubscribe, connect
//! - Topic-filter matching with MQTT `+`/`#` wildcard semantics
//! - The production MQTT binding ([`MqttTransport`]) over rumqttc, with
//!   mutual-TLS device identity and automatic subscription replay on
//!   reconnect
//!
//! Everything above this crate is broker-agnostic: tests substitute an
//! in-memory double implementing the same trait.

pub mod error;
mod filter;
pub mod mqtt;

pub use error::TransportError;
pub use filter::filter_matches;
pub use mqtt::{MqttSettings, MqttTransport, TlsFiles};

use async_trait::async_trait;
use std::sync::Arc;

/// Delivery guarantee requested for a publish or subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QosLevel {
    AtMostOnce,
    AtLeastOnce,
}

/// A message delivered by the broker.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Callback invoked for every message matching a subscription's filter.
///
/// Handlers run on the transport's delivery task and must not block; spawn
/// a task for anything long-running.
pub type MessageHandler = Arc<dyn Fn(InboundMessage) + Send + Sync>;

/// The pub/sub primitive the agent is built on.
///
/// Implementations must tolerate concurrent calls from independent job
/// sessions sharing one connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Waits until the connection is established.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Publishes a payload. For [`QosLevel::AtLeastOnce`] the call resolves
    /// once the publish is handed to the broker connection; callers that
    /// need a bounded wait wrap this in a timeout.
    async fn publish(
        &self,
        topic: &str,
        qos: QosLevel,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), TransportError>;

    /// Registers `handler` for every message matching `filter`.
    async fn subscribe(
        &self,
        filter: &str,
        qos: QosLevel,
        handler: MessageHandler,
    ) -> Result<(), TransportError>;

    /// Drops one registration for `filter`. The broker-side subscription is
    /// only torn down when no other registration for the same filter
    /// remains.
    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError>;
}
