//! # Transport
//!
//! The message-bus contract the federation core runs on, the JSON wire codec,
//! and an in-process loopback broker.
//!
//! ## Contract
//!
//! - Per-queue FIFO delivery to one handler invocation at a time
//! - Declaring an existing queue is a no-op
//! - Reconnection on transient failure is the implementation's concern

pub mod codec;
pub mod memory;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::federation::Envelope;

pub use codec::{decode_envelope, encode_envelope};
pub use memory::InMemoryBus;

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Transport errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Broker cannot be reached
    #[error("Broker unavailable at {0}")]
    BrokerUnavailable(String),

    /// Queue was never declared on this client
    #[error("Unknown queue: {0}")]
    UnknownQueue(String),

    /// Queue already has a consuming handler
    #[error("Queue {0} already has a handler attached")]
    HandlerBusy(String),

    /// Handler tag does not match the attached handler
    #[error("Unknown handler {tag} on queue {queue}")]
    UnknownHandler {
        /// Queue name
        queue: String,
        /// Handler tag
        tag: String,
    },

    /// Envelope could not be encoded or decoded
    #[error("Codec error: {0}")]
    Codec(String),
}

/// Broker connection parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerEndpoint {
    /// Broker host or address
    pub host: String,

    /// Broker port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Broker user
    #[serde(default = "default_credential")]
    pub user: String,

    /// Broker password
    #[serde(default = "default_credential")]
    pub password: String,
}

fn default_port() -> u16 {
    5672
}

fn default_credential() -> String {
    "guest".to_string()
}

impl BrokerEndpoint {
    /// Endpoint on the default port with default credentials
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            user: default_credential(),
            password: default_credential(),
        }
    }

    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Opaque tag identifying an attached handler
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandlerTag(String);

impl HandlerTag {
    /// Wrap a broker-issued tag
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    /// Tag text
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HandlerTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Consumer of envelopes delivered from one queue.
///
/// The bus invokes `consume` serially per queue, so implementations may keep
/// unsynchronized state behind `&mut self`. Implementations must not panic to
/// signal failure; they log and return.
pub trait EnvelopeConsumer: Send {
    /// Handle one delivered envelope
    fn consume(&mut self, envelope: Envelope);
}

/// Durable pub/sub client used by both coordinators
pub trait MessageBus: Send + Sync {
    /// Declare a queue on the given broker. Idempotent.
    fn create_queue(&self, name: &str, broker: &BrokerEndpoint) -> TransportResult<()>;

    /// Delete a queue and drop its handler and undelivered messages
    fn destroy_queue(&self, name: &str) -> TransportResult<()>;

    /// Start consuming a queue
    fn attach_handler(
        &self,
        name: &str,
        consumer: Box<dyn EnvelopeConsumer>,
    ) -> TransportResult<HandlerTag>;

    /// Stop consuming a queue
    fn detach_handler(&self, name: &str, tag: &HandlerTag) -> TransportResult<()>;

    /// Publish an envelope to a declared queue
    fn send(&self, envelope: &Envelope, name: &str) -> TransportResult<()>;
}
