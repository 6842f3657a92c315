//! # Handler & Permission Registry
//!
//! Records, per message type, who handles it and who may call it.
//!
//! - [`EventConfig`]: the set of local handlers for an event type.
//! - [`CommandConfig`]: the single handler of a local command type and the
//!   domains allowed to call it from outside.
//!
//! Populated before the bus starts, then shared read-only with every
//! endpoint as an `Arc` snapshot.

use crate::handlers::{CommandHandler, EventHandler};
use ddd_types::{DomainMessage, DomainPayload, TypeKey};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// Local handlers for one event type.
#[derive(Clone, Default)]
pub struct EventConfig {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventConfig {
    /// Adds handlers not already present. Identity is the `Arc` allocation.
    fn merge(&mut self, handlers: impl IntoIterator<Item = Arc<dyn EventHandler>>) {
        for handler in handlers {
            let known = self
                .handlers
                .iter()
                .any(|existing| same_allocation(existing, &handler));
            if !known {
                self.handlers.push(handler);
            }
        }
    }

    pub fn handlers(&self) -> &[Arc<dyn EventHandler>] {
        &self.handlers
    }
}

impl fmt::Debug for EventConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventConfig")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

/// Handler and inbound permissions for one command type.
#[derive(Clone, Default)]
pub struct CommandConfig {
    handler: Option<Arc<dyn CommandHandler>>,
    allowed_domains: BTreeSet<String>,
}

impl CommandConfig {
    pub fn handler(&self) -> Option<&Arc<dyn CommandHandler>> {
        self.handler.as_ref()
    }

    pub fn allowed_domains(&self) -> &BTreeSet<String> {
        &self.allowed_domains
    }
}

impl fmt::Debug for CommandConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandConfig")
            .field("has_handler", &self.handler.is_some())
            .field("allowed_domains", &self.allowed_domains)
            .finish()
    }
}

fn same_allocation<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Event and command configuration for every registered type.
#[derive(Debug, Clone, Default)]
pub struct HandlerRegistry {
    events: BTreeMap<TypeKey, EventConfig>,
    commands: BTreeMap<TypeKey, CommandConfig>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // MUTATION
    // =========================================================================

    /// Merges handlers into the event's set; repeat instances are ignored.
    /// Creates the entry even when `handlers` is empty.
    pub fn add_event_handlers(
        &mut self,
        key: TypeKey,
        handlers: impl IntoIterator<Item = Arc<dyn EventHandler>>,
    ) {
        self.events.entry(key).or_default().merge(handlers);
    }

    /// Sets the command's handler; the last call wins.
    pub fn set_command_handler(&mut self, key: TypeKey, handler: Arc<dyn CommandHandler>) {
        self.commands.entry(key).or_default().handler = Some(handler);
    }

    /// Records a command type without touching its handler.
    pub fn declare_command(&mut self, key: TypeKey) {
        self.commands.entry(key).or_default();
    }

    /// Merges domains into the command's allowed-caller set.
    pub fn add_command_permissions<D: Into<String>>(
        &mut self,
        key: TypeKey,
        domains: impl IntoIterator<Item = D>,
    ) {
        self.commands
            .entry(key)
            .or_default()
            .allowed_domains
            .extend(domains.into_iter().map(Into::into));
    }

    // =========================================================================
    // LOOKUP
    // =========================================================================

    /// True when `caller` may invoke the command from another domain.
    pub fn check_permission(&self, key: &TypeKey, caller: &str) -> bool {
        self.commands
            .get(key)
            .is_some_and(|config| config.allowed_domains.contains(caller))
    }

    pub fn check_permission_for(&self, command: &DomainMessage, caller: &str) -> bool {
        self.check_permission(&TypeKey::from(command), caller)
    }

    pub fn event_config(&self, key: &TypeKey) -> Option<&EventConfig> {
        self.events.get(key)
    }

    pub fn event_config_of<E: DomainPayload>(&self) -> Option<&EventConfig> {
        self.event_config(&TypeKey::of::<E>())
    }

    pub fn command_config(&self, key: &TypeKey) -> Option<&CommandConfig> {
        self.commands.get(key)
    }

    pub fn command_config_of<C: DomainPayload>(&self) -> Option<&CommandConfig> {
        self.command_config(&TypeKey::of::<C>())
    }

    /// Handlers registered for the event's type; empty when none.
    pub fn event_handlers(&self, event: &DomainMessage) -> &[Arc<dyn EventHandler>] {
        self.events
            .get(&TypeKey::from(event))
            .map(EventConfig::handlers)
            .unwrap_or_default()
    }

    pub fn command_handler(&self, command: &DomainMessage) -> Option<Arc<dyn CommandHandler>> {
        self.commands
            .get(&TypeKey::from(command))
            .and_then(|config| config.handler.clone())
    }

    /// Event types of `domain`, used for queue bindings.
    pub fn events_of<'a>(&'a self, domain: &'a str) -> impl Iterator<Item = &'a TypeKey> + 'a {
        self.events.keys().filter(move |key| key.domain == domain)
    }

    /// Command types of `domain`, used for queue bindings.
    pub fn commands_of<'a>(&'a self, domain: &'a str) -> impl Iterator<Item = &'a TypeKey> + 'a {
        self.commands.keys().filter(move |key| key.domain == domain)
    }
}
