//! # Wire Envelope
//!
//! Broker-level framing shared by every transport.
//!
//! | Property | COMMAND / EVENT | RESPONSE / ERROR |
//! |---|---|---|
//! | `type` | `COMMAND` / `EVENT` | `RESPONSE` / `ERROR` |
//! | routing key | `domain.TypeName` | reply queue name |
//! | `message_id` | message reference | - |
//! | `correlation_id` | - | command reference |
//! | `user_id` | publishing domain | publishing domain |
//! | `reply_to` | reply queue (commands) | - |
//! | `X-DDD-OBJECT-KEY` | `domain.TypeName` | error class key (ERROR) |

use crate::error::ProtocolError;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Header carrying the class key of the body.
pub const OBJECT_KEY_HEADER: &str = "X-DDD-OBJECT-KEY";

/// The `type` property of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    Command,
    Event,
    Response,
    Error,
}

impl EnvelopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeKind::Command => "COMMAND",
            EnvelopeKind::Event => "EVENT",
            EnvelopeKind::Response => "RESPONSE",
            EnvelopeKind::Error => "ERROR",
        }
    }

    /// Metric label.
    pub fn label(&self) -> &'static str {
        match self {
            EnvelopeKind::Command => "command",
            EnvelopeKind::Event => "event",
            EnvelopeKind::Response => "response",
            EnvelopeKind::Error => "error",
        }
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnvelopeKind {
    type Err = ProtocolError;

    /// Case-insensitive.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "COMMAND" => Ok(EnvelopeKind::Command),
            "EVENT" => Ok(EnvelopeKind::Event),
            "RESPONSE" => Ok(EnvelopeKind::Response),
            "ERROR" => Ok(EnvelopeKind::Error),
            _ => Err(ProtocolError::UnknownMessageKind(Some(s.to_string()))),
        }
    }
}

/// Message properties, as carried by AMQP basic properties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    /// Raw `type` property; parsed lazily so unknown tags reach the decoder.
    pub kind: Option<String>,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    /// Claimed publisher domain. Brokers reject a value that differs from
    /// the connection user.
    pub user_id: Option<String>,
    pub reply_to: Option<String>,
    pub headers: BTreeMap<String, String>,
}

/// A framed message as handed to or received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub routing_key: String,
    pub properties: Properties,
    pub body: Vec<u8>,
}

impl Envelope {
    pub fn new(kind: EnvelopeKind, routing_key: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            routing_key: routing_key.into(),
            properties: Properties {
                kind: Some(kind.as_str().to_string()),
                ..Properties::default()
            },
            body,
        }
    }

    pub fn kind(&self) -> Result<EnvelopeKind, ProtocolError> {
        self.properties
            .kind
            .as_deref()
            .ok_or(ProtocolError::UnknownMessageKind(None))?
            .parse()
    }

    pub fn object_key(&self) -> Option<&str> {
        self.properties
            .headers
            .get(OBJECT_KEY_HEADER)
            .map(String::as_str)
    }

    pub fn publisher(&self) -> Option<&str> {
        self.properties.user_id.as_deref()
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.properties.reply_to.as_deref()
    }

    /// Reference of the command this envelope belongs to: `correlation_id`
    /// on replies, `message_id` on commands.
    pub fn exchange_reference(&self) -> Option<Uuid> {
        self.properties
            .correlation_id
            .as_deref()
            .or(self.properties.message_id.as_deref())
            .and_then(|id| Uuid::parse_str(id).ok())
    }

    #[must_use]
    pub fn with_object_key(mut self, key: impl Into<String>) -> Self {
        self.properties
            .headers
            .insert(OBJECT_KEY_HEADER.to_string(), key.into());
        self
    }

    #[must_use]
    pub fn with_publisher(mut self, publisher: impl Into<String>) -> Self {
        self.properties.user_id = Some(publisher.into());
        self
    }
}
