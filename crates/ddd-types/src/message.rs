//! # Domain Messages
//!
//! Commands and events exchanged between domains.
//!
//! A payload type becomes a domain message by implementing [`DomainPayload`],
//! usually through the [`domain_command!`](crate::domain_command) and
//! [`domain_event!`](crate::domain_event) macros. The typed wrapper
//! [`Message<T>`] adds the identity every message carries on the wire:
//!
//! ```text
//! {"__reference__": "<uuid>", "__timestamp__": 1718000000.25, "data": { ...payload... }}
//! ```
//!
//! [`DomainMessage`] erases the payload type so the bus can route, encode and
//! queue messages of any registered type; handlers recover the typed value
//! with [`DomainMessage::downcast`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Role of a domain message. Commands and events share a structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MessageKind {
    /// A request expecting exactly one reply from the owning domain.
    Command,
    /// A fire-and-forget broadcast published by the owning domain.
    Event,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Command => write!(f, "command"),
            MessageKind::Event => write!(f, "event"),
        }
    }
}

/// A payload that can travel across domains.
///
/// `DOMAIN` and `NAME` together form the class key `"{DOMAIN}.{NAME}"`, which
/// doubles as the routing key of the message on the wire.
pub trait DomainPayload:
    Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static
{
    /// Owning domain.
    const DOMAIN: &'static str;
    /// Type name, unique within the domain.
    const NAME: &'static str;
    /// Command or event.
    const KIND: MessageKind;

    /// `"{DOMAIN}.{NAME}"`.
    fn class_key() -> String {
        format!("{}.{}", Self::DOMAIN, Self::NAME)
    }
}

/// Declares a struct as a command owned by `domain`.
///
/// ```ignore
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// pub struct CreateInvoice { pub amount: u64 }
/// ddd_types::domain_command!(CreateInvoice, "billing");
/// ```
#[macro_export]
macro_rules! domain_command {
    ($ty:ident, $domain:expr) => {
        impl $crate::DomainPayload for $ty {
            const DOMAIN: &'static str = $domain;
            const NAME: &'static str = stringify!($ty);
            const KIND: $crate::MessageKind = $crate::MessageKind::Command;
        }
    };
}

/// Declares a struct as an event owned by `domain`.
#[macro_export]
macro_rules! domain_event {
    ($ty:ident, $domain:expr) => {
        impl $crate::DomainPayload for $ty {
            const DOMAIN: &'static str = $domain;
            const NAME: &'static str = stringify!($ty);
            const KIND: $crate::MessageKind = $crate::MessageKind::Event;
        }
    };
}

/// Seconds since the UNIX epoch, with sub-second precision.
pub fn now_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or_default()
}

// =============================================================================
// TYPE KEY
// =============================================================================

/// `(domain, type name)` pair identifying a registered message type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeKey {
    pub domain: String,
    pub name: String,
}

impl TypeKey {
    pub fn new(domain: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            name: name.into(),
        }
    }

    /// Key of a payload type.
    pub fn of<T: DomainPayload>() -> Self {
        Self::new(T::DOMAIN, T::NAME)
    }

    /// Parses `"domain.Name"`. The domain is everything before the last dot.
    pub fn parse(class_key: &str) -> Option<Self> {
        let (domain, name) = class_key.rsplit_once('.')?;
        if domain.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self::new(domain, name))
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.domain, self.name)
    }
}

impl From<&DomainMessage> for TypeKey {
    fn from(message: &DomainMessage) -> Self {
        Self::new(message.domain(), message.type_name())
    }
}

// =============================================================================
// TYPED MESSAGE
// =============================================================================

/// A command or event instance with its wire identity.
///
/// Immutable once built: the reference and timestamp generated here are the
/// ones the receiving domain sees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message<T> {
    /// Unique per instance, reused as the correlation id of the reply.
    #[serde(rename = "__reference__")]
    pub reference: Uuid,
    /// Creation time, seconds since the UNIX epoch.
    #[serde(rename = "__timestamp__")]
    pub timestamp: f64,
    /// The payload.
    pub data: T,
}

impl<T: DomainPayload> Message<T> {
    /// Wraps a payload with a fresh reference and the current time.
    pub fn new(data: T) -> Self {
        Self {
            reference: Uuid::new_v4(),
            timestamp: now_timestamp(),
            data,
        }
    }

    pub fn domain(&self) -> &'static str {
        T::DOMAIN
    }

    pub fn type_name(&self) -> &'static str {
        T::NAME
    }

    pub fn kind(&self) -> MessageKind {
        T::KIND
    }

    /// Serializes to the wire body.
    pub fn dumps(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parses a wire body produced by [`Message::dumps`].
    pub fn loads(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }
}

// =============================================================================
// TYPE-ERASED MESSAGE
// =============================================================================

trait ErasedMessage: fmt::Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn dumps(&self) -> Result<Vec<u8>, serde_json::Error>;
}

impl<T: DomainPayload> ErasedMessage for Message<T> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn dumps(&self) -> Result<Vec<u8>, serde_json::Error> {
        Message::dumps(self)
    }
}

/// A domain message whose payload type is only known at runtime.
///
/// Cheap to clone; the payload is shared.
#[derive(Debug, Clone)]
pub struct DomainMessage {
    kind: MessageKind,
    domain: &'static str,
    type_name: &'static str,
    type_id: TypeId,
    reference: Uuid,
    timestamp: f64,
    inner: Arc<dyn ErasedMessage>,
}

impl DomainMessage {
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn domain(&self) -> &'static str {
        self.domain
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn reference(&self) -> Uuid {
        self.reference
    }

    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    pub fn is_command(&self) -> bool {
        self.kind == MessageKind::Command
    }

    pub fn is_event(&self) -> bool {
        self.kind == MessageKind::Event
    }

    /// `"{domain}.{type_name}"`.
    pub fn class_key(&self) -> String {
        format!("{}.{}", self.domain, self.type_name)
    }

    /// True when the erased payload is a `T`.
    pub fn is<T: DomainPayload>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }

    /// Recovers the typed message, or `None` when the payload is not a `T`.
    pub fn downcast<T: DomainPayload>(&self) -> Option<&Message<T>> {
        self.inner.as_any().downcast_ref::<Message<T>>()
    }

    /// Serializes to the wire body.
    pub fn dumps(&self) -> Result<Vec<u8>, serde_json::Error> {
        self.inner.dumps()
    }
}

impl<T: DomainPayload> From<Message<T>> for DomainMessage {
    fn from(message: Message<T>) -> Self {
        Self {
            kind: T::KIND,
            domain: T::DOMAIN,
            type_name: T::NAME,
            type_id: TypeId::of::<T>(),
            reference: message.reference,
            timestamp: message.timestamp,
            inner: Arc::new(message),
        }
    }
}
