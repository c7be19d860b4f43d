//! Error types for the transport boundary

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by [`crate::Transport`] implementations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport has no live broker connection.
    #[error("transport is not connected")]
    NotConnected,

    /// The connection was not established within the allowed time.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// A publish was not acknowledged within the bounded wait.
    #[error("publish not acknowledged within {0:?}")]
    PublishTimeout(Duration),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("subscribe failed: {0}")]
    Subscribe(String),

    #[error("unsubscribe failed: {0}")]
    Unsubscribe(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
