//! Endpoint for a peer domain: sends it commands, receives the replies and
//! consumes the peer events this service subscribed to.

use super::{
    abandon, publish, DomainEndpoint, EndpointContext, EndpointState, Session, StateCell,
    COMMANDS_EXCHANGE, EVENTS_EXCHANGE,
};
use crate::codec::{decode, encode_message, Inbound};
use crate::correlation::{sweep_task, CorrelationTable};
use crate::envelope::Envelope;
use crate::error::BusError;
use crate::handlers::dispatch_event;
use crate::transport::{BrokerChannel, ConsumeOptions, DeliveryHandler, ExchangeKind, QueueOptions};
use async_trait::async_trait;
use ddd_telemetry::metrics::{
    COMMAND_LATENCY, COMMAND_TIMEOUTS, ENDPOINT_STARTS, MESSAGES_RECEIVED, PROTOCOL_ERRORS,
};
use ddd_telemetry::{metric_inc, time_histogram};
use ddd_types::{CommandResponse, DomainMessage, ErrorRegistry, MessageRegistry};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

struct RemoteRuntime {
    session: Session,
    commands: Arc<dyn BrokerChannel>,
    reply_queue: String,
    sweeper: JoinHandle<()>,
}

/// Talks to one peer domain inside the peer's virtual host.
pub struct RemoteDomainEndpoint {
    context: EndpointContext,
    peer: String,
    state: StateCell,
    pending: Arc<CorrelationTable>,
    runtime: Mutex<Option<RemoteRuntime>>,
}

impl RemoteDomainEndpoint {
    pub fn new(context: EndpointContext, peer: &str) -> Self {
        Self {
            context,
            peer: peer.to_string(),
            state: StateCell::new(peer),
            pending: Arc::new(CorrelationTable::new()),
            runtime: Mutex::new(None),
        }
    }

    /// Commands sent from here still waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.pending.pending_count()
    }

    async fn open(&self) -> Result<RemoteRuntime, BusError> {
        let connection = self
            .context
            .broker
            .connect(&self.peer, &self.context.self_domain)
            .await?;
        let mut session = Session::new(connection);

        match self.declare_topology(&mut session).await {
            Ok((commands, reply_queue)) => {
                let sweeper = tokio::spawn(sweep_task(
                    Arc::clone(&self.pending),
                    self.context.config.sweep_interval,
                ));
                Ok(RemoteRuntime {
                    session,
                    commands,
                    reply_queue,
                    sweeper,
                })
            }
            Err(err) => {
                abandon(session, &self.peer).await;
                Err(err)
            }
        }
    }

    /// Returns the command publishing channel and the reply queue name.
    async fn declare_topology(
        &self,
        session: &mut Session,
    ) -> Result<(Arc<dyn BrokerChannel>, String), BusError> {
        let config = &self.context.config;
        let connection = Arc::clone(&session.connection);

        // Private reply queue
        let replies = connection.open_channel().await?;
        let reply_queue = replies.declare_queue("", QueueOptions::private()).await?;
        let consumer = Arc::new(ReplyConsumer {
            peer: self.peer.clone(),
            pending: Arc::clone(&self.pending),
            messages: Arc::clone(&self.context.messages),
            errors: Arc::clone(&self.context.errors),
        });
        let tag = replies
            .consume(&reply_queue, ConsumeOptions { no_ack: true }, consumer)
            .await?;
        session.track_consumer(replies, tag);

        let commands = connection.open_channel().await?;
        commands
            .declare_exchange(COMMANDS_EXCHANGE, ExchangeKind::Topic)
            .await?;

        // Subscribed peer events
        let routing_keys: Vec<String> = self
            .context
            .handlers
            .events_of(&self.peer)
            .map(ToString::to_string)
            .collect();
        if routing_keys.is_empty() {
            debug!(peer = %self.peer, "No peer events subscribed; skipping event queue");
        } else {
            let events = connection.open_channel().await?;
            events
                .declare_exchange(EVENTS_EXCHANGE, ExchangeKind::Topic)
                .await?;
            events.set_prefetch(config.prefetch_count).await?;
            let queue = events
                .declare_queue(
                    &self.context.self_domain,
                    QueueOptions::shared(config.permanent_consume),
                )
                .await?;
            for routing_key in &routing_keys {
                events.bind_queue(&queue, EVENTS_EXCHANGE, routing_key).await?;
            }

            let consumer = Arc::new(EventConsumer {
                peer: self.peer.clone(),
                context: self.context.clone(),
            });
            let tag = events
                .consume(&queue, ConsumeOptions::default(), consumer)
                .await?;
            session.track_consumer(events, tag);
            debug!(peer = %self.peer, events = routing_keys.len(), queue = %queue, "Event queue bound");
        }

        Ok((commands, reply_queue))
    }

    fn command_route(&self) -> Result<(Arc<dyn BrokerChannel>, String), BusError> {
        self.runtime
            .lock()
            .as_ref()
            .map(|runtime| (Arc::clone(&runtime.commands), runtime.reply_queue.clone()))
            .ok_or_else(|| BusError::NotRunning {
                domain: self.peer.clone(),
            })
    }
}

#[async_trait]
impl DomainEndpoint for RemoteDomainEndpoint {
    fn domain(&self) -> &str {
        &self.peer
    }

    fn state(&self) -> EndpointState {
        self.state.get()
    }

    async fn start(&self) -> Result<(), BusError> {
        self.state.transition(EndpointState::Starting)?;

        match self.open().await {
            Ok(runtime) => {
                *self.runtime.lock() = Some(runtime);
                self.state.transition(EndpointState::Running)?;
                metric_inc!(ENDPOINT_STARTS, &["remote", "ok"]);
                info!(domain = %self.context.self_domain, peer = %self.peer, "[Bus] ✓ Remote endpoint running");
                Ok(())
            }
            Err(err) => {
                self.state.transition(EndpointState::Failed)?;
                metric_inc!(ENDPOINT_STARTS, &["remote", "failed"]);
                error!(domain = %self.context.self_domain, peer = %self.peer, error = %err, "[Bus] ✗ Remote endpoint failed to start");
                Err(err)
            }
        }
    }

    async fn stop(&self) -> Result<(), BusError> {
        if !self.state.begin_stop()? {
            return Ok(());
        }

        let runtime = self.runtime.lock().take();
        let closed = match runtime {
            Some(runtime) => {
                runtime.sweeper.abort();
                runtime.session.close(&self.peer).await
            }
            None => Ok(()),
        };
        let abandoned = self.pending.cancel_all();
        if abandoned > 0 {
            warn!(peer = %self.peer, abandoned, "Pending commands cancelled by stop");
        }

        self.state.transition(EndpointState::Stopped)?;
        info!(domain = %self.context.self_domain, peer = %self.peer, "[Bus] Remote endpoint stopped");
        closed
    }

    async fn handle_command(
        &self,
        command: DomainMessage,
        timeout: Option<Duration>,
    ) -> Result<CommandResponse, BusError> {
        self.state.ensure_running()?;
        let (commands, reply_queue) = self.command_route()?;
        let self_domain = self.context.self_domain.as_str();
        let reference = command.reference();
        let key = command.class_key();

        // The slot must exist before a reply can arrive.
        let (_guard, reply) = self
            .pending
            .register(reference, &key, timeout)
            .ok_or(BusError::DuplicateReference(reference))?;
        let _timer = time_histogram!(COMMAND_LATENCY);

        let envelope = encode_message(&command, self_domain, Some(&reply_queue))?;
        publish(&commands, COMMANDS_EXCHANGE, envelope, self_domain).await?;
        debug!(peer = %self.peer, %reference, command = %key, "Command sent");

        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, reply).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    metric_inc!(COMMAND_TIMEOUTS, &[self.peer.as_str()]);
                    warn!(peer = %self.peer, %reference, command = %key, timeout_ms = limit.as_millis() as u64, "Command timed out");
                    return Err(BusError::RequestTimeout {
                        reference,
                        timeout: limit,
                    });
                }
            },
            None => reply.await,
        };

        match outcome {
            Ok(reply) => reply.map_err(BusError::from),
            // Slot cancelled underneath us by stop().
            Err(_) => Err(BusError::NotRunning {
                domain: self.peer.clone(),
            }),
        }
    }

    /// Events of a peer are published by the peer.
    async fn handle_event(&self, event: DomainMessage) -> Result<(), BusError> {
        debug!(peer = %self.peer, event = %event.class_key(), "Remote endpoint does not publish events");
        Ok(())
    }
}

// =============================================================================
// CONSUMERS
// =============================================================================

/// Resolves pending commands from RESPONSE and ERROR replies.
struct ReplyConsumer {
    peer: String,
    pending: Arc<CorrelationTable>,
    messages: Arc<MessageRegistry>,
    errors: Arc<ErrorRegistry>,
}

#[async_trait]
impl DeliveryHandler for ReplyConsumer {
    async fn on_delivery(&self, envelope: Envelope) {
        let Some(reference) = envelope.exchange_reference() else {
            metric_inc!(PROTOCOL_ERRORS, &["uncorrelated"]);
            warn!(peer = %self.peer, "Dropping reply without correlation id");
            return;
        };

        let reply = match decode(&envelope, &self.messages, &self.errors) {
            Ok(Inbound::Response(response)) => Ok(response),
            Ok(Inbound::Error(error)) => Err(error),
            Ok(_) => {
                metric_inc!(PROTOCOL_ERRORS, &["unexpected_kind"]);
                warn!(peer = %self.peer, %reference, "Dropping non-reply delivery on reply queue");
                return;
            }
            Err(err) => {
                metric_inc!(PROTOCOL_ERRORS, &[err.reason()]);
                warn!(peer = %self.peer, %reference, error = %err, "Undecodable reply");
                if !self.pending.is_pending(&reference) {
                    return;
                }
                Err(err.to_domain_error(reference))
            }
        };

        let label = if reply.is_ok() { "response" } else { "error" };
        metric_inc!(MESSAGES_RECEIVED, &[label, self.peer.as_str()]);
        self.pending.complete(reference, reply);
    }
}

/// Dispatches subscribed peer events to local handlers.
struct EventConsumer {
    peer: String,
    context: EndpointContext,
}

#[async_trait]
impl DeliveryHandler for EventConsumer {
    async fn on_delivery(&self, envelope: Envelope) {
        let peer = self.peer.as_str();
        let event = match decode(&envelope, &self.context.messages, &self.context.errors) {
            Ok(Inbound::Event(event)) => event,
            Ok(_) => {
                metric_inc!(PROTOCOL_ERRORS, &["unexpected_kind"]);
                warn!(peer, routing_key = %envelope.routing_key, "Dropping non-event delivery on event queue");
                return;
            }
            Err(err) => {
                metric_inc!(PROTOCOL_ERRORS, &[err.reason()]);
                warn!(peer, routing_key = %envelope.routing_key, error = %err, "Undecodable event");
                return;
            }
        };

        if envelope.publisher() != Some(peer) || event.domain() != peer {
            metric_inc!(PROTOCOL_ERRORS, &["foreign_publisher"]);
            warn!(
                peer,
                publisher = envelope.publisher().unwrap_or_default(),
                event = %event.class_key(),
                "Dropping event not published by its own domain"
            );
            return;
        }
        metric_inc!(MESSAGES_RECEIVED, &["event", peer]);

        let handlers = self.context.handlers.event_handlers(&event);
        let failures = dispatch_event(handlers, &event).await;
        if failures > 0 {
            debug!(peer, event = %event.class_key(), failures, "Event handled with failures");
        }
    }
}
