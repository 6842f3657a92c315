//! # DDD Types Crate
//!
//! Cross-domain value types exchanged by the domain message bus:
//!
//! - [`Message<T>`] / [`DomainMessage`]: commands and events, typed and erased.
//! - [`CommandResponse`]: the successful reply to a command.
//! - [`DomainError`] / [`ErrorClass`]: typed failures returned in place of a
//!   response.
//! - [`MessageRegistry`] / [`ErrorRegistry`]: explicit registration that maps
//!   `domain.TypeName` class keys back to concrete types.
//!
//! ## Design Principles
//!
//! - **Explicit registration**: nothing registers itself. A startup routine
//!   walks a fixed list of types, so registration order is deterministic.
//! - **Reference is the exchange id**: a command's `reference` is reused as
//!   the correlation id of its reply, so one UUID identifies the exchange.

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod domain_error;
pub mod errors;
pub mod message;
pub mod registry;
pub mod response;

pub use domain_error::{
    DomainError, ErrorClass, INCOMING_MESSAGE_ERROR, INTERNAL_SERVICE_ERROR, SERVICE_NAMESPACE,
};
pub use errors::RegistryError;
pub use message::{now_timestamp, DomainMessage, DomainPayload, Message, MessageKind, TypeKey};
pub use registry::{ErrorRegistry, MessageDescriptor, MessageRegistry};
pub use response::CommandResponse;
