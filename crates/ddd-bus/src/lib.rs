//! # DDD Bus - Cross-Domain Message Bus
//!
//! Lets services that each own a domain exchange events, commands and typed
//! errors over a shared broker.
//!
//! ## Topology
//!
//! Every domain has its own virtual host. A service connects to its own host
//! to publish events and serve commands, and to each peer's host to send
//! commands and consume the peer events it subscribed to.
//!
//! ```text
//!  vhost "billing"                                 service "orders"
//! ┌──────────────────────────────────────┐       ┌─────────────────────┐
//! │ exchange "commands" ──► queue         │◄──────│ send CreateInvoice  │
//! │   billing.CreateInvoice   "commands"  │       │  (reply_to = q)     │
//! │                             │         │       │                     │
//! │                    billing service    │       │                     │
//! │                             │ reply   │       │                     │
//! │ default exchange ──► amq.gen-* (q) ───┼──────►│ correlation table   │
//! │                                       │       │                     │
//! │ exchange "events" ──► queue "orders" ─┼──────►│ event handlers      │
//! │   billing.InvoiceCreated              │       │                     │
//! └──────────────────────────────────────┘       └─────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! - Exactly one reply (RESPONSE or ERROR) per command that reaches a handler.
//! - Callers not listed in a command's allowed domains get no reply at all.
//! - Handler failures never escape: unclassified errors and panics become an
//!   internal service error.
//! - A timeout is a [`BusError::RequestTimeout`], never a domain error.

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod bus;
pub mod codec;
pub mod config;
pub mod correlation;
pub mod endpoint;
pub mod envelope;
pub mod error;
pub mod handlers;
pub mod registry;
pub mod transport;

pub use bus::DomainMessageBus;
pub use codec::{decode, encode_error, encode_message, encode_response, Inbound};
pub use config::BusConfig;
pub use correlation::{CorrelationTable, Reply};
pub use endpoint::{
    DefaultEndpointFactory, DomainEndpoint, EndpointContext, EndpointFactory, EndpointState,
    RemoteDomainEndpoint, SelfDomainEndpoint,
};
pub use envelope::{Envelope, EnvelopeKind, Properties, OBJECT_KEY_HEADER};
pub use error::{BusError, ProtocolError};
pub use handlers::{
    command_handler, dispatch_event, event_handler, execute_command, CommandHandler, EventHandler,
    HandlerError,
};
pub use registry::{CommandConfig, EventConfig, HandlerRegistry};
pub use transport::memory::InMemoryBroker;
pub use transport::{
    Broker, BrokerChannel, BrokerConnection, ConsumeOptions, DeliveryHandler, ExchangeKind,
    QueueOptions, TransportError,
};

// Re-exported so applications need only this crate.
pub use ddd_types::{
    CommandResponse, DomainError, DomainMessage, DomainPayload, ErrorClass, Message, MessageKind,
    TypeKey, INCOMING_MESSAGE_ERROR, INTERNAL_SERVICE_ERROR,
};
