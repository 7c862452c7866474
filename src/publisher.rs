// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! Maps a `MessageEnvelope` onto AMQP message properties and publishes it.
//! The OpenTelemetry context of the caller travels in the message headers.

use crate::{
    channel::BrokerChannel, envelope::MessageEnvelope, errors::AmqpError, otel,
};
use lapin::{
    types::{FieldTable, ShortString},
    BasicProperties,
};
use std::collections::BTreeMap;

/// Content type of published messages
pub const DEFAULT_CONTENT_TYPE: &str = "text/plain";

/// AMQP delivery mode asking the broker to persist the message
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Builds the AMQP properties of an outgoing message.
///
/// The trace id becomes the correlation id, the message type the AMQP `type`.
pub(crate) fn message_properties(envelope: &MessageEnvelope, persistent: bool) -> BasicProperties {
    let mut headers = BTreeMap::new();
    otel::inject_current_context(&mut headers);

    let mut props = BasicProperties::default()
        .with_content_type(ShortString::from(DEFAULT_CONTENT_TYPE))
        .with_message_id(ShortString::from(envelope.message_id.clone()))
        .with_type(ShortString::from(envelope.message_type.clone()))
        .with_timestamp(envelope.sent_time.timestamp().max(0) as u64)
        .with_headers(FieldTable::from(headers));

    if let Some(trace_id) = &envelope.trace_id {
        props = props.with_correlation_id(ShortString::from(trace_id.clone()));
    }

    if persistent {
        props = props.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
    }

    props
}

/// Publishes an envelope to `exchange` with `routing_key`.
pub(crate) async fn publish(
    channel: &dyn BrokerChannel,
    exchange: &str,
    routing_key: &str,
    envelope: &MessageEnvelope,
    persistent: bool,
) -> Result<(), AmqpError> {
    channel
        .publish(
            exchange,
            routing_key,
            &envelope.message,
            message_properties(envelope, persistent),
        )
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_envelope_fields_to_properties() {
        let envelope = MessageEnvelope::from_string(Some("trace-1"), "Created", "{}");

        let props = message_properties(&envelope, true);

        assert_eq!(
            props.correlation_id().as_ref().map(|v| v.to_string()),
            Some("trace-1".to_owned())
        );
        assert_eq!(
            props.message_id().as_ref().map(|v| v.to_string()),
            Some(envelope.message_id.clone())
        );
        assert_eq!(
            props.kind().as_ref().map(|v| v.to_string()),
            Some("Created".to_owned())
        );
        assert_eq!(
            props.content_type().as_ref().map(|v| v.to_string()),
            Some(DEFAULT_CONTENT_TYPE.to_owned())
        );
        assert_eq!(*props.delivery_mode(), Some(PERSISTENT_DELIVERY_MODE));
    }

    #[test]
    fn transient_message_without_trace_id() {
        let envelope = MessageEnvelope::from_string(None, "Test", "x");

        let props = message_properties(&envelope, false);

        assert_eq!(*props.correlation_id(), None);
        assert_eq!(*props.delivery_mode(), None);
    }
}
