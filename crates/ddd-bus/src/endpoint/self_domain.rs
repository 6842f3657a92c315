//! Endpoint for the bus's own domain: publishes its events and serves its
//! commands.

use super::{
    abandon, publish, DomainEndpoint, EndpointContext, EndpointState, Session, StateCell,
    COMMANDS_EXCHANGE, COMMANDS_QUEUE, DEFAULT_EXCHANGE, EVENTS_EXCHANGE,
};
use crate::codec::{decode, encode_error, encode_message, encode_response, Inbound};
use crate::correlation::Reply;
use crate::envelope::Envelope;
use crate::error::{BusError, ProtocolError};
use crate::handlers::{dispatch_event, execute_command};
use crate::transport::{BrokerChannel, ConsumeOptions, DeliveryHandler, ExchangeKind, QueueOptions};
use async_trait::async_trait;
use ddd_telemetry::metric_inc;
use ddd_telemetry::metrics::{
    COMMAND_TIMEOUTS, ENDPOINT_STARTS, MESSAGES_RECEIVED, PERMISSION_DENIED, PROTOCOL_ERRORS,
};
use ddd_types::{CommandResponse, DomainMessage, INTERNAL_SERVICE_ERROR};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

struct SelfRuntime {
    session: Session,
    events: Arc<dyn BrokerChannel>,
}

/// Publishes the domain's events and consumes commands addressed to it.
pub struct SelfDomainEndpoint {
    context: EndpointContext,
    state: StateCell,
    runtime: Mutex<Option<SelfRuntime>>,
}

impl SelfDomainEndpoint {
    pub fn new(context: EndpointContext) -> Self {
        let state = StateCell::new(&context.self_domain);
        Self {
            context,
            state,
            runtime: Mutex::new(None),
        }
    }

    async fn open(&self) -> Result<SelfRuntime, BusError> {
        let domain = self.context.self_domain.as_str();
        let connection = self.context.broker.connect(domain, domain).await?;
        let mut session = Session::new(connection);

        match self.declare_topology(&mut session).await {
            Ok(events) => Ok(SelfRuntime { session, events }),
            Err(err) => {
                abandon(session, domain).await;
                Err(err)
            }
        }
    }

    /// Returns the event publishing channel.
    async fn declare_topology(&self, session: &mut Session) -> Result<Arc<dyn BrokerChannel>, BusError> {
        let domain = self.context.self_domain.as_str();
        let config = &self.context.config;
        let connection = Arc::clone(&session.connection);

        let events = connection.open_channel().await?;
        events
            .declare_exchange(EVENTS_EXCHANGE, ExchangeKind::Topic)
            .await?;

        let replies = connection.open_channel().await?;

        let commands = connection.open_channel().await?;
        commands
            .declare_exchange(COMMANDS_EXCHANGE, ExchangeKind::Topic)
            .await?;
        commands.set_prefetch(config.prefetch_count).await?;
        let queue = commands
            .declare_queue(COMMANDS_QUEUE, QueueOptions::shared(config.permanent_consume))
            .await?;

        let routing_keys: Vec<String> = self
            .context
            .handlers
            .commands_of(domain)
            .map(ToString::to_string)
            .collect();
        for routing_key in &routing_keys {
            commands
                .bind_queue(&queue, COMMANDS_EXCHANGE, routing_key)
                .await?;
        }

        let consumer = Arc::new(CommandConsumer {
            context: self.context.clone(),
            replies,
        });
        let tag = commands
            .consume(&queue, ConsumeOptions::default(), consumer)
            .await?;
        session.track_consumer(commands, tag);

        debug!(domain, commands = routing_keys.len(), "Command queue bound");
        Ok(events)
    }

    fn events_channel(&self) -> Result<Arc<dyn BrokerChannel>, BusError> {
        self.runtime
            .lock()
            .as_ref()
            .map(|runtime| Arc::clone(&runtime.events))
            .ok_or_else(|| BusError::NotRunning {
                domain: self.context.self_domain.clone(),
            })
    }
}

#[async_trait]
impl DomainEndpoint for SelfDomainEndpoint {
    fn domain(&self) -> &str {
        &self.context.self_domain
    }

    fn state(&self) -> EndpointState {
        self.state.get()
    }

    async fn start(&self) -> Result<(), BusError> {
        self.state.transition(EndpointState::Starting)?;
        let domain = self.domain();

        match self.open().await {
            Ok(runtime) => {
                *self.runtime.lock() = Some(runtime);
                self.state.transition(EndpointState::Running)?;
                metric_inc!(ENDPOINT_STARTS, &["self", "ok"]);
                info!(domain, "[Bus] ✓ Self-domain endpoint running");
                Ok(())
            }
            Err(err) => {
                self.state.transition(EndpointState::Failed)?;
                metric_inc!(ENDPOINT_STARTS, &["self", "failed"]);
                error!(domain, error = %err, "[Bus] ✗ Self-domain endpoint failed to start");
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
            Some(runtime) => runtime.session.close(self.domain()).await,
            None => Ok(()),
        };
        self.state.transition(EndpointState::Stopped)?;
        info!(domain = self.domain(), "[Bus] Self-domain endpoint stopped");
        closed
    }

    async fn handle_command(
        &self,
        command: DomainMessage,
        timeout: Option<Duration>,
    ) -> Result<CommandResponse, BusError> {
        self.state.ensure_running()?;

        let handler = self.context.handlers.command_handler(&command).ok_or_else(|| {
            ProtocolError::UnregisteredClass {
                key: command.class_key(),
            }
        })?;
        let reference = command.reference();
        debug!(domain = self.domain(), %reference, command = %command.class_key(), "Handling own command locally");

        let execution = execute_command(&handler, command);
        let reply = match timeout {
            Some(limit) => tokio::time::timeout(limit, execution).await.map_err(|_| {
                metric_inc!(COMMAND_TIMEOUTS, &[self.domain()]);
                BusError::RequestTimeout {
                    reference,
                    timeout: limit,
                }
            })?,
            None => execution.await,
        };
        reply.map_err(BusError::from)
    }

    async fn handle_event(&self, event: DomainMessage) -> Result<(), BusError> {
        self.state.ensure_running()?;
        let domain = self.domain();
        let events = self.events_channel()?;

        let envelope = encode_message(&event, domain, None)?;
        publish(&events, EVENTS_EXCHANGE, envelope, domain).await?;
        debug!(domain, reference = %event.reference(), event = %event.class_key(), "Event published");

        let handlers = self.context.handlers.event_handlers(&event);
        if !handlers.is_empty() {
            dispatch_event(handlers, &event).await;
        }
        Ok(())
    }
}

// =============================================================================
// COMMAND CONSUMER
// =============================================================================

struct CommandConsumer {
    context: EndpointContext,
    /// Publishes replies through the default exchange.
    replies: Arc<dyn BrokerChannel>,
}

impl CommandConsumer {
    /// Sends exactly one reply. A response that cannot be encoded is replaced
    /// by an internal service error.
    async fn reply(&self, reply_to: &str, reply: Reply) {
        let domain = self.context.self_domain.as_str();
        let reference = match &reply {
            Ok(response) => response.reference,
            Err(error) => error.reference,
        };
        let encoded = match &reply {
            Ok(response) => encode_response(response, domain, reply_to),
            Err(error) => encode_error(error, domain, reply_to),
        };
        let envelope = match encoded {
            Ok(envelope) => envelope,
            Err(err) => {
                error!(domain, %reference, error = %err, "Failed to encode reply");
                let fallback = INTERNAL_SERVICE_ERROR.raise().with_reference(reference);
                match encode_error(&fallback, domain, reply_to) {
                    Ok(envelope) => envelope,
                    Err(_) => return,
                }
            }
        };

        if let Err(err) = publish(&self.replies, DEFAULT_EXCHANGE, envelope, domain).await {
            warn!(domain, %reference, reply_to, error = %err, "Failed to publish reply");
        }
    }
}

#[async_trait]
impl DeliveryHandler for CommandConsumer {
    async fn on_delivery(&self, envelope: Envelope) {
        let domain = self.context.self_domain.as_str();
        let reply_to = envelope.reply_to().map(str::to_string);
        let caller = envelope.publisher().unwrap_or_default().to_string();

        let command = match decode(&envelope, &self.context.messages, &self.context.errors) {
            Ok(Inbound::Command(command)) => command,
            Ok(_) => {
                metric_inc!(PROTOCOL_ERRORS, &["unexpected_kind"]);
                warn!(domain, routing_key = %envelope.routing_key, "Dropping non-command delivery");
                return;
            }
            Err(err) => {
                metric_inc!(PROTOCOL_ERRORS, &[err.reason()]);
                warn!(domain, routing_key = %envelope.routing_key, caller = %caller, error = %err, "Undecodable command");
                if let (Some(reply_to), Some(reference)) =
                    (reply_to.as_deref(), envelope.exchange_reference())
                {
                    self.reply(reply_to, Err(err.to_domain_error(reference))).await;
                }
                return;
            }
        };
        metric_inc!(MESSAGES_RECEIVED, &["command", domain]);

        let key = command.class_key();
        let reference = command.reference();
        if !self.context.handlers.check_permission_for(&command, &caller) {
            metric_inc!(PERMISSION_DENIED, &[key.as_str()]);
            debug!(domain, command = %key, caller = %caller, %reference, "Command not permitted for caller; dropped");
            return;
        }

        let Some(handler) = self.context.handlers.command_handler(&command) else {
            warn!(domain, command = %key, "No handler for bound command");
            return;
        };
        let reply = execute_command(&handler, command).await;

        match reply_to {
            Some(reply_to) => self.reply(&reply_to, reply).await,
            None => debug!(domain, command = %key, %reference, "Command without reply address; reply dropped"),
        }
    }
}
