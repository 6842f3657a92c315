//! # Domain Message Bus
//!
//! Entry point for applications. Registers message types and handlers, then
//! starts one endpoint for the own domain and one per peer domain.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let mut bus = DomainMessageBus::new(BusConfig::new("billing"), broker);
//!
//! bus.register_command::<CreateInvoice>(Some(create_invoice), ["orders"])?;
//! bus.register_event::<InvoiceCreated>([])?;
//! bus.register_event::<OrderPlaced>([on_order_placed])?;
//! bus.register_error(INSUFFICIENT_FUNDS)?;
//!
//! bus.start().await?;
//! bus.publish(Message::new(InvoiceCreated { .. })).await?;
//! bus.stop().await;
//! ```
//!
//! Registration is only possible before `start()`; the registries are frozen
//! into every endpoint when it starts.

use crate::config::BusConfig;
use crate::endpoint::{
    DefaultEndpointFactory, DomainEndpoint, EndpointContext, EndpointFactory, EndpointState,
};
use crate::envelope::EnvelopeKind;
use crate::error::{BusError, ProtocolError};
use crate::handlers::{CommandHandler, EventHandler};
use crate::registry::HandlerRegistry;
use crate::transport::Broker;
use ddd_types::{
    CommandResponse, DomainMessage, DomainPayload, ErrorClass, ErrorRegistry, Message,
    MessageKind, MessageRegistry, TypeKey,
};
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Endpoints of a running bus.
struct Endpoints {
    own: Arc<dyn DomainEndpoint>,
    peers: BTreeMap<String, Arc<dyn DomainEndpoint>>,
    /// Own endpoint first, then peers in registration order.
    all: Vec<Arc<dyn DomainEndpoint>>,
}

/// Cross-domain message bus of one service.
pub struct DomainMessageBus {
    config: Arc<BusConfig>,
    broker: Arc<dyn Broker>,
    factory: Arc<dyn EndpointFactory>,
    messages: MessageRegistry,
    errors: ErrorRegistry,
    handlers: HandlerRegistry,
    /// Peer domains in the order they were first registered.
    peers: Vec<String>,
    started: AtomicBool,
    endpoints: Mutex<Option<Endpoints>>,
}

impl DomainMessageBus {
    pub fn new(config: BusConfig, broker: Arc<dyn Broker>) -> Self {
        Self::with_factory(config, broker, Arc::new(DefaultEndpointFactory))
    }

    /// Bus whose endpoints are built by `factory`.
    pub fn with_factory(
        config: BusConfig,
        broker: Arc<dyn Broker>,
        factory: Arc<dyn EndpointFactory>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            broker,
            factory,
            messages: MessageRegistry::new(),
            errors: ErrorRegistry::new(),
            handlers: HandlerRegistry::new(),
            peers: Vec::new(),
            started: AtomicBool::new(false),
            endpoints: Mutex::new(None),
        }
    }

    pub fn domain(&self) -> &str {
        &self.config.domain
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Peer domains in registration order.
    pub fn peers(&self) -> &[String] {
        &self.peers
    }

    pub fn messages(&self) -> &MessageRegistry {
        &self.messages
    }

    pub fn errors(&self) -> &ErrorRegistry {
        &self.errors
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub fn is_running(&self) -> bool {
        self.endpoints.lock().is_some()
    }

    /// State of the endpoint for `domain`, if the bus is running.
    pub fn endpoint_state(&self, domain: &str) -> Option<EndpointState> {
        let endpoints = self.endpoints.lock();
        let endpoints = endpoints.as_ref()?;
        if domain == self.config.domain {
            Some(endpoints.own.state())
        } else {
            endpoints.peers.get(domain).map(|endpoint| endpoint.state())
        }
    }

    // =========================================================================
    // REGISTRATION
    // =========================================================================

    fn ensure_not_started(&self) -> Result<(), BusError> {
        if self.started.load(Ordering::SeqCst) {
            Err(BusError::AlreadyStarted)
        } else {
            Ok(())
        }
    }

    fn track_peer(&mut self, domain: &str) {
        if !self.peers.iter().any(|peer| peer == domain) {
            self.peers.push(domain.to_string());
        }
    }

    /// Registers an event type with local handlers.
    ///
    /// Foreign events need at least one handler. Own events need none; their
    /// handlers run in-process after each publish.
    pub fn register_event<E: DomainPayload>(
        &mut self,
        handlers: impl IntoIterator<Item = Arc<dyn EventHandler>>,
    ) -> Result<(), BusError> {
        self.ensure_not_started()?;
        let key = TypeKey::of::<E>();
        if E::KIND != MessageKind::Event {
            return Err(BusError::HandlerRequired {
                key: key.to_string(),
                reason: "type is declared as a command".into(),
            });
        }

        let handlers: Vec<Arc<dyn EventHandler>> = handlers.into_iter().collect();
        let foreign = E::DOMAIN != self.config.domain;
        if foreign && handlers.is_empty() {
            return Err(BusError::HandlerRequired {
                key: key.to_string(),
                reason: "events of another domain need at least one local handler".into(),
            });
        }

        self.messages.ensure::<E>()?;
        debug!(domain = %self.config.domain, event = %key, handlers = handlers.len(), "Registered event");
        self.handlers.add_event_handlers(key, handlers);
        if foreign {
            self.track_peer(E::DOMAIN);
        }
        Ok(())
    }

    /// Registers a command type.
    ///
    /// Own commands need a handler and may name the domains allowed to call
    /// them. Commands of another domain are registered without a handler so
    /// replies to them can be decoded.
    pub fn register_command<C, D>(
        &mut self,
        handler: Option<Arc<dyn CommandHandler>>,
        allowed_domains: impl IntoIterator<Item = D>,
    ) -> Result<(), BusError>
    where
        C: DomainPayload,
        D: Into<String>,
    {
        self.ensure_not_started()?;
        let key = TypeKey::of::<C>();
        if C::KIND != MessageKind::Command {
            return Err(BusError::HandlerRequired {
                key: key.to_string(),
                reason: "type is declared as an event".into(),
            });
        }
        let allowed: Vec<String> = allowed_domains.into_iter().map(Into::into).collect();

        if C::DOMAIN == self.config.domain {
            let Some(handler) = handler else {
                return Err(BusError::HandlerRequired {
                    key: key.to_string(),
                    reason: "commands of the own domain need a handler".into(),
                });
            };
            self.messages.ensure::<C>()?;
            self.handlers.set_command_handler(key.clone(), handler);
            self.handlers.add_command_permissions(key.clone(), allowed.iter().cloned());
            debug!(domain = %self.config.domain, command = %key, allowed = ?allowed, "Registered command");
        } else {
            if handler.is_some() {
                return Err(BusError::HandlerRequired {
                    key: key.to_string(),
                    reason: "commands of another domain are handled by that domain".into(),
                });
            }
            if !allowed.is_empty() {
                warn!(command = %key, "Ignoring allowed domains for a command of another domain");
            }
            self.messages.ensure::<C>()?;
            self.handlers.declare_command(key.clone());
            self.track_peer(C::DOMAIN);
            debug!(domain = %self.config.domain, command = %key, "Registered peer command");
        }
        Ok(())
    }

    /// Registers an error class so replies carrying it can be decoded.
    pub fn register_error(&mut self, class: ErrorClass) -> Result<(), BusError> {
        self.ensure_not_started()?;
        self.errors.register(class)?;
        Ok(())
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Starts every endpoint concurrently.
    ///
    /// All or nothing: if any endpoint fails, every endpoint is stopped again
    /// and the first error in registration order is returned.
    pub async fn start(&self) -> Result<(), BusError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(BusError::AlreadyStarted);
        }

        let context = EndpointContext {
            self_domain: self.config.domain.clone(),
            config: Arc::clone(&self.config),
            broker: Arc::clone(&self.broker),
            messages: Arc::new(self.messages.clone()),
            errors: Arc::new(self.errors.clone()),
            handlers: Arc::new(self.handlers.clone()),
        };

        let own = self.factory.self_endpoint(context.clone());
        let mut peers = BTreeMap::new();
        let mut all = vec![Arc::clone(&own)];
        for peer in &self.peers {
            let endpoint = self.factory.remote_endpoint(context.clone(), peer);
            peers.insert(peer.clone(), Arc::clone(&endpoint));
            all.push(endpoint);
        }

        info!(domain = %self.config.domain, peers = ?self.peers, "[Bus] Starting {} endpoints...", all.len());
        let results = join_all(all.iter().map(|endpoint| endpoint.start())).await;

        let mut first_error = None;
        for (endpoint, result) in all.iter().zip(results) {
            if let Err(err) = result {
                error!(domain = %self.config.domain, endpoint = endpoint.domain(), error = %err, "[Bus] ✗ Endpoint failed to start");
                first_error.get_or_insert(err);
            }
        }

        if let Some(err) = first_error {
            warn!(domain = %self.config.domain, "[Bus] Rolling back started endpoints");
            stop_all(&all).await;
            self.started.store(false, Ordering::SeqCst);
            return Err(err);
        }

        *self.endpoints.lock() = Some(Endpoints { own, peers, all });
        info!(domain = %self.config.domain, "[Bus] ✓ All endpoints running");
        Ok(())
    }

    /// Stops every endpoint concurrently. Failures are logged, not returned.
    pub async fn stop(&self) {
        let Some(endpoints) = self.endpoints.lock().take() else {
            return;
        };
        info!(domain = %self.config.domain, "[Bus] Stopping {} endpoints...", endpoints.all.len());
        stop_all(&endpoints.all).await;
        self.started.store(false, Ordering::SeqCst);
        info!(domain = %self.config.domain, "[Bus] All endpoints stopped");
    }

    // =========================================================================
    // MESSAGING
    // =========================================================================

    /// Routes a command or event by its domain.
    ///
    /// Commands resolve to their reply; events to `None` once published.
    /// Without an explicit timeout the configured default applies.
    pub async fn handle(
        &self,
        message: impl Into<DomainMessage>,
        timeout: Option<Duration>,
    ) -> Result<Option<CommandResponse>, BusError> {
        let message = message.into();
        match message.kind() {
            MessageKind::Command => self.dispatch_command(message, timeout).await.map(Some),
            MessageKind::Event => self.dispatch_event(message).await.map(|()| None),
        }
    }

    /// Sends a command and waits for its reply.
    pub async fn send<C: DomainPayload>(
        &self,
        command: Message<C>,
        timeout: Option<Duration>,
    ) -> Result<CommandResponse, BusError> {
        self.dispatch_command(command.into(), timeout).await
    }

    /// Publishes an event of the own domain.
    pub async fn publish<E: DomainPayload>(&self, event: Message<E>) -> Result<(), BusError> {
        self.dispatch_event(event.into()).await
    }

    async fn dispatch_command(
        &self,
        command: DomainMessage,
        timeout: Option<Duration>,
    ) -> Result<CommandResponse, BusError> {
        if !command.is_command() {
            return Err(ProtocolError::KindMismatch {
                key: command.class_key(),
                registered: command.kind(),
                received: EnvelopeKind::Command,
            }
            .into());
        }
        let timeout = timeout.or(self.config.default_timeout);
        let endpoint = self.endpoint_for(command.domain())?;
        endpoint.handle_command(command, timeout).await
    }

    async fn dispatch_event(&self, event: DomainMessage) -> Result<(), BusError> {
        if !event.is_event() {
            return Err(ProtocolError::KindMismatch {
                key: event.class_key(),
                registered: event.kind(),
                received: EnvelopeKind::Event,
            }
            .into());
        }
        if event.domain() != self.config.domain {
            return Err(BusError::ForbiddenCrossDomainPublish {
                bus_domain: self.config.domain.clone(),
                event: event.class_key(),
            });
        }
        let endpoint = self.endpoint_for(event.domain())?;
        endpoint.handle_event(event).await
    }

    fn endpoint_for(&self, domain: &str) -> Result<Arc<dyn DomainEndpoint>, BusError> {
        let own = domain == self.config.domain;
        if !own && !self.peers.iter().any(|peer| peer == domain) {
            return Err(BusError::UnregisteredDomain(domain.to_string()));
        }

        let endpoints = self.endpoints.lock();
        let Some(endpoints) = endpoints.as_ref() else {
            return Err(BusError::NotRunning {
                domain: domain.to_string(),
            });
        };
        if own {
            Ok(Arc::clone(&endpoints.own))
        } else {
            endpoints
                .peers
                .get(domain)
                .cloned()
                .ok_or_else(|| BusError::UnregisteredDomain(domain.to_string()))
        }
    }
}

async fn stop_all(endpoints: &[Arc<dyn DomainEndpoint>]) {
    let results = join_all(endpoints.iter().map(|endpoint| endpoint.stop())).await;
    for (endpoint, result) in endpoints.iter().zip(results) {
        if let Err(err) = result {
            warn!(endpoint = endpoint.domain(), error = %err, "[Bus] Endpoint failed to stop cleanly");
        }
    }
}
