//! Conversion between bus envelopes and AMQP basic properties.

use ddd_bus::{Envelope, Properties};
use lapin::message::Delivery;
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::BasicProperties;
use std::collections::BTreeMap;

const CONTENT_TYPE: &str = "application/json";

/// Basic properties for an outbound envelope.
pub fn to_basic_properties(properties: &Properties) -> BasicProperties {
    let mut basic = BasicProperties::default().with_content_type(CONTENT_TYPE.into());

    if let Some(kind) = &properties.kind {
        basic = basic.with_kind(kind.as_str().into());
    }
    if let Some(message_id) = &properties.message_id {
        basic = basic.with_message_id(message_id.as_str().into());
    }
    if let Some(correlation_id) = &properties.correlation_id {
        basic = basic.with_correlation_id(correlation_id.as_str().into());
    }
    if let Some(user_id) = &properties.user_id {
        basic = basic.with_user_id(user_id.as_str().into());
    }
    if let Some(reply_to) = &properties.reply_to {
        basic = basic.with_reply_to(reply_to.as_str().into());
    }

    if !properties.headers.is_empty() {
        let mut headers = FieldTable::default();
        for (name, value) in &properties.headers {
            headers.insert(
                ShortString::from(name.as_str()),
                AMQPValue::LongString(value.clone().into()),
            );
        }
        basic = basic.with_headers(headers);
    }
    basic
}

fn text(value: &Option<ShortString>) -> Option<String> {
    value.as_ref().map(|v| v.as_str().to_string())
}

/// String-valued headers; other value types are not part of the protocol
/// and are skipped.
fn headers(table: &Option<FieldTable>) -> BTreeMap<String, String> {
    let Some(table) = table else {
        return BTreeMap::new();
    };
    table
        .inner()
        .iter()
        .filter_map(|(name, value)| {
            let value = match value {
                AMQPValue::LongString(v) => String::from_utf8_lossy(v.as_bytes()).into_owned(),
                AMQPValue::ShortString(v) => v.as_str().to_string(),
                _ => return None,
            };
            Some((name.as_str().to_string(), value))
        })
        .collect()
}

/// Envelope properties of inbound basic properties.
pub fn from_basic_properties(basic: &BasicProperties) -> Properties {
    Properties {
        kind: text(basic.kind()),
        message_id: text(basic.message_id()),
        correlation_id: text(basic.correlation_id()),
        user_id: text(basic.user_id()),
        reply_to: text(basic.reply_to()),
        headers: headers(basic.headers()),
    }
}

/// Envelope of an inbound delivery.
pub fn envelope_of(delivery: &Delivery) -> Envelope {
    Envelope {
        routing_key: delivery.routing_key.as_str().to_string(),
        properties: from_basic_properties(&delivery.properties),
        body: delivery.data.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ddd_bus::{EnvelopeKind, OBJECT_KEY_HEADER};

    #[test]
    fn test_protocol_properties_survive_conversion() {
        let mut envelope = Envelope::new(EnvelopeKind::Command, "billing.CreateInvoice", Vec::new())
            .with_object_key("billing.CreateInvoice")
            .with_publisher("orders");
        envelope.properties.message_id = Some("7f1c0a52-5a35-4bd5-8d3c-3f8a3f2b8e11".into());
        envelope.properties.reply_to = Some("amq.gen-abc".into());

        let basic = to_basic_properties(&envelope.properties);
        assert_eq!(
            basic.content_type().as_ref().map(ShortString::as_str),
            Some(CONTENT_TYPE)
        );

        let back = from_basic_properties(&basic);
        assert_eq!(back, envelope.properties);
        assert_eq!(
            back.headers.get(OBJECT_KEY_HEADER).map(String::as_str),
            Some("billing.CreateInvoice")
        );
    }

    #[test]
    fn test_non_string_headers_skipped() {
        let mut table = FieldTable::default();
        table.insert("x-retries".into(), AMQPValue::LongUInt(3));
        table.insert(
            OBJECT_KEY_HEADER.into(),
            AMQPValue::LongString("billing.InvoiceCreated".to_string().into()),
        );
        let basic = BasicProperties::default().with_headers(table);

        let properties = from_basic_properties(&basic);
        assert_eq!(properties.headers.len(), 1);
        assert!(properties.kind.is_none());
    }
}
