//! # Bus Errors
//!
//! What a caller of the bus can see go wrong. A [`BusError::Domain`] is an
//! application failure reported by the remote handler; everything else is a
//! failure of the bus itself.

use crate::envelope::EnvelopeKind;
use crate::endpoint::EndpointState;
use crate::transport::TransportError;
use ddd_types::{DomainError, MessageKind, RegistryError, INCOMING_MESSAGE_ERROR};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Failures at the decode boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The `type` property is absent or not one of the four tags.
    #[error("Unknown message kind: {0:?}")]
    UnknownMessageKind(Option<String>),

    /// No registered type for the routing key or object key.
    #[error("Unregistered class: {key}")]
    UnregisteredClass { key: String },

    /// The body does not parse as the resolved type.
    #[error("Malformed body for {key}: {reason}")]
    MalformedBody { key: String, reason: String },

    /// The routing key names a type of the other kind.
    #[error("Kind mismatch: {key} is a {registered}, envelope is {received}")]
    KindMismatch {
        key: String,
        registered: MessageKind,
        received: EnvelopeKind,
    },

    /// Serializing an outbound message failed.
    #[error("Failed to encode {key}: {reason}")]
    Encode { key: String, reason: String },
}

impl ProtocolError {
    /// Metric label.
    pub fn reason(&self) -> &'static str {
        match self {
            ProtocolError::UnknownMessageKind(_) => "unknown_kind",
            ProtocolError::UnregisteredClass { .. } => "unregistered",
            ProtocolError::MalformedBody { .. } => "malformed",
            ProtocolError::KindMismatch { .. } => "kind_mismatch",
            ProtocolError::Encode { .. } => "encode",
        }
    }

    /// Service error sent back to a caller whose message could not be
    /// processed.
    pub fn to_domain_error(&self, reference: Uuid) -> DomainError {
        INCOMING_MESSAGE_ERROR
            .with_extra([("reason", self.to_string())])
            .with_reference(reference)
    }
}

impl From<RegistryError> for ProtocolError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnregisteredClass { key } | RegistryError::DuplicateRegistration { key } => {
                ProtocolError::UnregisteredClass { key }
            }
        }
    }
}

/// Errors returned by [`crate::DomainMessageBus`] and its endpoints.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// The remote handler failed; carries the decoded error.
    #[error("{0}")]
    Domain(DomainError),

    /// No reply arrived in time. Distinct from any domain error.
    #[error("Request {reference} timed out after {timeout:?}")]
    RequestTimeout { reference: Uuid, timeout: Duration },

    /// A bus may only publish events of its own domain.
    #[error("Domain {bus_domain} cannot publish event {event} of another domain")]
    ForbiddenCrossDomainPublish { bus_domain: String, event: String },

    /// Registration rejected because of a missing or misplaced handler.
    #[error("Invalid handler registration for {key}: {reason}")]
    HandlerRequired { key: String, reason: String },

    /// The message belongs to a domain with no registered types.
    #[error("Domain {0} is not registered on this bus")]
    UnregisteredDomain(String),

    /// Registration attempted after `start()`.
    #[error("Bus already started; register all types before start()")]
    AlreadyStarted,

    #[error("Endpoint for {domain} is not running")]
    NotRunning { domain: String },

    /// The same command instance is already in flight.
    #[error("Command {0} is already awaiting a reply")]
    DuplicateReference(Uuid),

    #[error("Invalid endpoint transition for {domain}: {from:?} -> {to:?}")]
    InvalidTransition {
        domain: String,
        from: EndpointState,
        to: EndpointState,
    },
}

impl From<DomainError> for BusError {
    fn from(err: DomainError) -> Self {
        BusError::Domain(err)
    }
}

impl BusError {
    /// The domain error carried by this failure, if any.
    pub fn domain_error(&self) -> Option<&DomainError> {
        match self {
            BusError::Domain(err) => Some(err),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, BusError::RequestTimeout { .. })
    }
}
