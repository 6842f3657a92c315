//! # Transport
//!
//! The broker operations the endpoints need, as traits. Mirrors the AMQP
//! model: a connection per virtual host, channels on it, exchanges, queues,
//! bindings and consumers.
//!
//! Implementations:
//! - [`memory::InMemoryBroker`]: in-process broker for tests and single-binary
//!   deployments.
//! - `ddd-bus-amqp`: RabbitMQ via `lapin`.

pub mod memory;

use crate::envelope::Envelope;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Broker-level failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Connection to virtual host {vhost} refused: {reason}")]
    ConnectionRefused { vhost: String, reason: String },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Exchange not found: {0}")]
    ExchangeNotFound(String),

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    /// Exclusive queue owned by another connection.
    #[error("Queue {0} is locked by another connection")]
    ResourceLocked(String),

    /// Redeclaration with different options, or a forged `user_id`.
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Publish failed: {0}")]
    Publish(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Routes by pattern: `*` matches one word, `#` zero or more.
    Topic,
    /// Routes by exact routing key.
    Direct,
}

/// Queue declaration flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Survives broker restarts.
    pub durable: bool,
    /// Owned by the declaring connection and deleted with it.
    pub exclusive: bool,
    /// Deleted once its last consumer is cancelled.
    pub auto_delete: bool,
}

impl QueueOptions {
    /// Private reply queue.
    pub fn private() -> Self {
        Self {
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }

    /// Shared work queue, durable or ephemeral.
    pub fn shared(permanent: bool) -> Self {
        Self {
            durable: permanent,
            exclusive: false,
            auto_delete: !permanent,
        }
    }
}

/// Consumer flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Deliveries count as acknowledged when sent.
    pub no_ack: bool,
}

/// Receives deliveries from a consumer.
///
/// Each delivery runs as its own task; concurrency is bounded by the
/// channel's prefetch count.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn on_delivery(&self, envelope: Envelope);
}

/// Opens connections to virtual hosts.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Connects to `vhost` authenticated as `user`.
    async fn connect(
        &self,
        vhost: &str,
        user: &str,
    ) -> Result<Arc<dyn BrokerConnection>, TransportError>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, TransportError>;

    /// Closes the connection; its exclusive queues and consumers go with it.
    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), TransportError>;

    /// Declares a queue and returns its name. An empty name asks the broker
    /// to generate one.
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String, TransportError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError>;

    /// Limits unacknowledged deliveries per consumer; 0 is unlimited.
    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError>;

    /// Publishes to `exchange` (empty for the default exchange, which routes
    /// to the queue named by the routing key).
    async fn publish(&self, exchange: &str, envelope: Envelope) -> Result<(), TransportError>;

    /// Starts consuming `queue`; returns the consumer tag.
    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<String, TransportError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError>;
}

/// Topic pattern match: words separated by `.`, `*` matches exactly one
/// word, `#` matches zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(word), Some(k)) if word == k => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}
