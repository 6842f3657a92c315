//! # Domain Endpoints
//!
//! One endpoint per domain the bus talks to. Each owns a broker connection
//! to that domain's virtual host.
//!
//! ```text
//!                  ┌──────────────────────────────┐
//!   own domain ───►│ SelfDomainEndpoint           │  vhost = self
//!                  │  events ex. (publish)        │
//!                  │  commands ex. + queue (serve)│
//!                  └──────────────────────────────┘
//!                  ┌──────────────────────────────┐
//!   peer domain ──►│ RemoteDomainEndpoint         │  vhost = peer
//!                  │  commands ex. (send)         │
//!                  │  reply queue (exclusive)     │
//!                  │  events ex. + queue "self"   │
//!                  └──────────────────────────────┘
//! ```
//!
//! Both connect as the bus's own domain user; the broker stamps that identity
//! into `user_id`, which is what inbound permission checks trust.

mod remote;
mod self_domain;

pub use remote::RemoteDomainEndpoint;
pub use self_domain::SelfDomainEndpoint;

use crate::config::BusConfig;
use crate::envelope::Envelope;
use crate::error::BusError;
use crate::registry::HandlerRegistry;
use crate::transport::{Broker, BrokerChannel, BrokerConnection};
use async_trait::async_trait;
use ddd_telemetry::metrics::MESSAGES_PUBLISHED;
use ddd_types::{CommandResponse, DomainMessage, ErrorRegistry, MessageRegistry};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Topic exchange carrying a domain's events.
pub const EVENTS_EXCHANGE: &str = "events";
/// Topic exchange carrying commands addressed to a domain.
pub const COMMANDS_EXCHANGE: &str = "commands";
/// Work queue the owning domain consumes commands from.
pub const COMMANDS_QUEUE: &str = "commands";
/// Routes to the queue named by the routing key.
pub const DEFAULT_EXCHANGE: &str = "";

// =============================================================================
// LIFECYCLE
// =============================================================================

/// Lifecycle of a [`DomainEndpoint`].
///
/// ```text
/// Created ─┐
///          ├─► Starting ──► Running ──► Stopping ──► Stopped
/// Stopped ─┘       │                       ▲
///                  └──► Failed ────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointState {
    /// Built, never started.
    Created,
    /// Connecting and declaring topology.
    Starting,
    /// Consuming and accepting messages.
    Running,
    /// Start failed; resources already released.
    Failed,
    /// Cancelling consumers and closing the connection.
    Stopping,
    /// Closed; may be started again.
    Stopped,
}

impl EndpointState {
    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: EndpointState) -> bool {
        use EndpointState::*;
        matches!(
            (self, next),
            (Created, Starting)
                | (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Failed)
                | (Running, Stopping)
                | (Failed, Stopping)
                | (Stopping, Stopped)
        )
    }
}

impl fmt::Display for EndpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EndpointState::Created => "created",
            EndpointState::Starting => "starting",
            EndpointState::Running => "running",
            EndpointState::Failed => "failed",
            EndpointState::Stopping => "stopping",
            EndpointState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Guarded lifecycle state of one endpoint.
pub(crate) struct StateCell {
    domain: String,
    state: Mutex<EndpointState>,
}

impl StateCell {
    pub(crate) fn new(domain: &str) -> Self {
        Self {
            domain: domain.to_string(),
            state: Mutex::new(EndpointState::Created),
        }
    }

    pub(crate) fn get(&self) -> EndpointState {
        *self.state.lock()
    }

    /// Moves to `next`; returns the previous state.
    pub(crate) fn transition(&self, next: EndpointState) -> Result<EndpointState, BusError> {
        let mut state = self.state.lock();
        let current = *state;
        if !current.can_transition_to(next) {
            return Err(BusError::InvalidTransition {
                domain: self.domain.clone(),
                from: current,
                to: next,
            });
        }
        *state = next;
        Ok(current)
    }

    /// Enters `Stopping`. `Ok(false)` when there is nothing to stop.
    pub(crate) fn begin_stop(&self) -> Result<bool, BusError> {
        match self.get() {
            EndpointState::Created | EndpointState::Stopped => Ok(false),
            _ => self.transition(EndpointState::Stopping).map(|_| true),
        }
    }

    pub(crate) fn ensure_running(&self) -> Result<(), BusError> {
        if self.get() == EndpointState::Running {
            Ok(())
        } else {
            Err(BusError::NotRunning {
                domain: self.domain.clone(),
            })
        }
    }
}

// =============================================================================
// ENDPOINT CONTRACT
// =============================================================================

/// A connection to one domain's slice of the broker.
#[async_trait]
pub trait DomainEndpoint: Send + Sync {
    /// Domain this endpoint talks to.
    fn domain(&self) -> &str;

    fn state(&self) -> EndpointState;

    /// Connects and declares topology. On failure every resource opened so
    /// far is released and the endpoint is left `Failed`.
    async fn start(&self) -> Result<(), BusError>;

    /// Cancels consumers and closes the connection. No-op when never started
    /// or already stopped.
    async fn stop(&self) -> Result<(), BusError>;

    /// Sends a command to this endpoint's domain and waits for the reply.
    async fn handle_command(
        &self,
        command: DomainMessage,
        timeout: Option<Duration>,
    ) -> Result<CommandResponse, BusError>;

    /// Publishes an event of this endpoint's domain.
    async fn handle_event(&self, event: DomainMessage) -> Result<(), BusError>;
}

/// Everything an endpoint needs from its bus, frozen at `start()`.
#[derive(Clone)]
pub struct EndpointContext {
    pub self_domain: String,
    pub config: Arc<BusConfig>,
    pub broker: Arc<dyn Broker>,
    pub messages: Arc<MessageRegistry>,
    pub errors: Arc<ErrorRegistry>,
    pub handlers: Arc<HandlerRegistry>,
}

impl fmt::Debug for EndpointContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointContext")
            .field("self_domain", &self.self_domain)
            .field("messages", &self.messages.len())
            .finish()
    }
}

/// Builds the endpoints of a bus. Replace it to customise endpoint behaviour.
pub trait EndpointFactory: Send + Sync {
    fn self_endpoint(&self, context: EndpointContext) -> Arc<dyn DomainEndpoint>;

    fn remote_endpoint(&self, context: EndpointContext, peer: &str) -> Arc<dyn DomainEndpoint>;
}

/// Builds [`SelfDomainEndpoint`] and [`RemoteDomainEndpoint`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultEndpointFactory;

impl EndpointFactory for DefaultEndpointFactory {
    fn self_endpoint(&self, context: EndpointContext) -> Arc<dyn DomainEndpoint> {
        Arc::new(SelfDomainEndpoint::new(context))
    }

    fn remote_endpoint(&self, context: EndpointContext, peer: &str) -> Arc<dyn DomainEndpoint> {
        Arc::new(RemoteDomainEndpoint::new(context, peer))
    }
}

// =============================================================================
// SHARED PLUMBING
// =============================================================================

/// An open connection and the consumers running on it.
pub(crate) struct Session {
    pub(crate) connection: Arc<dyn BrokerConnection>,
    consumers: Vec<(Arc<dyn BrokerChannel>, String)>,
}

impl Session {
    pub(crate) fn new(connection: Arc<dyn BrokerConnection>) -> Self {
        Self {
            connection,
            consumers: Vec::new(),
        }
    }

    pub(crate) fn track_consumer(&mut self, channel: Arc<dyn BrokerChannel>, tag: String) {
        self.consumers.push((channel, tag));
    }

    /// Cancels consumers, then closes the connection.
    pub(crate) async fn close(self, domain: &str) -> Result<(), BusError> {
        for (channel, tag) in &self.consumers {
            if let Err(e) = channel.cancel(tag).await {
                warn!(domain, consumer_tag = %tag, error = %e, "Failed to cancel consumer");
            }
        }
        self.connection.close().await?;
        Ok(())
    }
}

/// Closes a session after a failed start without masking the start error.
pub(crate) async fn abandon(session: Session, domain: &str) {
    if let Err(e) = session.close(domain).await {
        warn!(domain, error = %e, "Failed to release connection after failed start");
    }
}

/// Publishes and counts the envelope.
pub(crate) async fn publish(
    channel: &Arc<dyn BrokerChannel>,
    exchange: &str,
    envelope: Envelope,
    domain: &str,
) -> Result<(), BusError> {
    let label = envelope
        .kind()
        .map(|kind| kind.label())
        .unwrap_or("unknown");
    channel.publish(exchange, envelope).await?;
    MESSAGES_PUBLISHED.with_label_values(&[label, domain]).inc();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_transitions() {
        let cell = StateCell::new("billing");
        assert_eq!(cell.get(), EndpointState::Created);

        cell.transition(EndpointState::Starting).unwrap();
        cell.transition(EndpointState::Running).unwrap();
        assert!(cell.ensure_running().is_ok());
        assert!(cell.begin_stop().unwrap());
        cell.transition(EndpointState::Stopped).unwrap();

        assert!(!cell.begin_stop().unwrap());
        assert!(cell.ensure_running().is_err());
    }

    #[test]
    fn test_failed_start_can_still_stop() {
        let cell = StateCell::new("billing");
        cell.transition(EndpointState::Starting).unwrap();
        cell.transition(EndpointState::Failed).unwrap();
        assert!(cell.begin_stop().unwrap());
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let cell = StateCell::new("billing");
        let err = cell.transition(EndpointState::Running).unwrap_err();
        assert!(matches!(
            err,
            BusError::InvalidTransition {
                from: EndpointState::Created,
                to: EndpointState::Running,
                ..
            }
        ));
        assert_eq!(cell.get(), EndpointState::Created);
    }

    #[test]
    fn test_never_started_stop_is_noop() {
        let cell = StateCell::new("billing");
        assert!(!cell.begin_stop().unwrap());
        assert_eq!(cell.get(), EndpointState::Created);
    }
}
