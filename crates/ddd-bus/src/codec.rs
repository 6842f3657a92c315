//! # Envelope Codec
//!
//! Converts domain messages, responses and errors to [`Envelope`]s and back.
//!
//! ```text
//!  DomainMessage ──encode_message──► Envelope{COMMAND|EVENT, rk = domain.Type}
//!  CommandResponse ─encode_response► Envelope{RESPONSE, correlation_id}
//!  DomainError ───encode_error─────► Envelope{ERROR, correlation_id, object key}
//!
//!  Envelope ──decode(registries)──► Inbound::{Command, Event, Response, Error}
//! ```

use crate::envelope::{Envelope, EnvelopeKind};
use crate::error::ProtocolError;
use ddd_types::{
    CommandResponse, DomainError, DomainMessage, ErrorRegistry, MessageKind, MessageRegistry,
};

/// A decoded inbound envelope.
#[derive(Debug, Clone)]
pub enum Inbound {
    Command(DomainMessage),
    Event(DomainMessage),
    Response(CommandResponse),
    Error(DomainError),
}

/// Frames a command or event.
///
/// `reply_to` is only meaningful for commands.
pub fn encode_message(
    message: &DomainMessage,
    publisher: &str,
    reply_to: Option<&str>,
) -> Result<Envelope, ProtocolError> {
    let key = message.class_key();
    let body = message.dumps().map_err(|e| ProtocolError::Encode {
        key: key.clone(),
        reason: e.to_string(),
    })?;
    let kind = match message.kind() {
        MessageKind::Command => EnvelopeKind::Command,
        MessageKind::Event => EnvelopeKind::Event,
    };

    let mut envelope = Envelope::new(kind, key.clone(), body)
        .with_object_key(key)
        .with_publisher(publisher);
    envelope.properties.message_id = Some(message.reference().to_string());
    envelope.properties.reply_to = reply_to.map(str::to_string);
    Ok(envelope)
}

/// Frames a successful reply addressed to `reply_to`.
pub fn encode_response(
    response: &CommandResponse,
    publisher: &str,
    reply_to: &str,
) -> Result<Envelope, ProtocolError> {
    let body = response.dumps().map_err(|e| ProtocolError::Encode {
        key: "CommandResponse".to_string(),
        reason: e.to_string(),
    })?;

    let mut envelope = Envelope::new(EnvelopeKind::Response, reply_to, body).with_publisher(publisher);
    envelope.properties.correlation_id = Some(response.reference.to_string());
    Ok(envelope)
}

/// Frames an error reply addressed to `reply_to`.
pub fn encode_error(
    error: &DomainError,
    publisher: &str,
    reply_to: &str,
) -> Result<Envelope, ProtocolError> {
    let key = error.class_key();
    let body = error.dump().map_err(|e| ProtocolError::Encode {
        key: key.clone(),
        reason: e.to_string(),
    })?;

    let mut envelope = Envelope::new(EnvelopeKind::Error, reply_to, body)
        .with_object_key(key)
        .with_publisher(publisher);
    envelope.properties.correlation_id = Some(error.reference.to_string());
    Ok(envelope)
}

/// Decodes an inbound envelope using the registries.
pub fn decode(
    envelope: &Envelope,
    messages: &MessageRegistry,
    errors: &ErrorRegistry,
) -> Result<Inbound, ProtocolError> {
    let kind = envelope.kind()?;
    match kind {
        EnvelopeKind::Command | EnvelopeKind::Event => {
            // Default-exchange deliveries carry the queue name as routing key.
            let key = match envelope.routing_key.as_str() {
                "" => envelope.object_key().unwrap_or_default(),
                routing_key => routing_key,
            };
            let descriptor = messages.resolve_key(key)?;

            let expected = if kind == EnvelopeKind::Command {
                MessageKind::Command
            } else {
                MessageKind::Event
            };
            if descriptor.kind != expected {
                return Err(ProtocolError::KindMismatch {
                    key: key.to_string(),
                    registered: descriptor.kind,
                    received: kind,
                });
            }

            let message = descriptor
                .decode(&envelope.body)
                .map_err(|e| ProtocolError::MalformedBody {
                    key: key.to_string(),
                    reason: e.to_string(),
                })?;
            Ok(match expected {
                MessageKind::Command => Inbound::Command(message),
                MessageKind::Event => Inbound::Event(message),
            })
        }
        EnvelopeKind::Response => CommandResponse::loads(&envelope.body)
            .map(Inbound::Response)
            .map_err(|e| ProtocolError::MalformedBody {
                key: "CommandResponse".to_string(),
                reason: e.to_string(),
            }),
        EnvelopeKind::Error => {
            let key = envelope.object_key().unwrap_or_default();
            let class = errors.resolve_key(key)?;
            DomainError::load(&class, &envelope.body)
                .map(Inbound::Error)
                .map_err(|e| ProtocolError::MalformedBody {
                    key: key.to_string(),
                    reason: e.to_string(),
                })
        }
    }
}
