// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! This module translates broker deliveries into envelopes and runs the push-mode
//! listen loop. Each delivery is handed to the registered `MessageReceiver`
//! together with the queue, then acknowledged unless the receiver already
//! completed or abandoned it. The loop creates an OpenTelemetry consumer span
//! per delivery, joined to the publisher's trace through the message headers.

use crate::{
    channel::{BrokerChannel, BrokerDelivery, DeliveryStream},
    envelope::{DeliveryToken, MessageEnvelope},
    errors::AmqpError,
    message_queue::{MessageQueue, MessageReceiver},
    otel,
    rabbitmq_queue::RabbitMQMessageQueue,
};
use chrono::Utc;
use futures_util::StreamExt;
use lapin::protocol::basic::AMQPProperties;
use opentelemetry::{
    context::FutureExt,
    global,
    trace::{Status, TraceContextExt},
};
use std::{
    borrow::Cow,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Translates a broker delivery into an envelope.
///
/// With a `generation` the envelope keeps a token for the delivery so it can be
/// completed or abandoned later; without one the delivery is not owned by the
/// caller (peek).
pub(crate) fn to_envelope(delivery: BrokerDelivery, generation: Option<u64>) -> MessageEnvelope {
    let (message_id, message_type, trace_id) = extract_header_properties(&delivery.properties);

    let mut envelope = MessageEnvelope::new(trace_id.as_deref(), &message_type, delivery.data);
    envelope.message_id = message_id;
    envelope.sent_time = Utc::now();

    if let Some(generation) = generation {
        envelope.set_reference(DeliveryToken::new(delivery.delivery_tag, generation));
    }

    envelope
}

/// Extracts message id, message type and correlation id from message properties.
fn extract_header_properties(props: &AMQPProperties) -> (String, String, Option<String>) {
    let message_id = match props.message_id() {
        Some(value) => value.to_string(),
        _ => "".to_owned(),
    };

    let msg_type = match props.kind() {
        Some(value) => value.to_string(),
        _ => "".to_owned(),
    };

    let trace_id = props.correlation_id().as_ref().map(|v| v.to_string());

    (message_id, msg_type, trace_id)
}

/// Everything the listen loop needs, moved into the spawned task.
pub(crate) struct Listener {
    pub(crate) queue: RabbitMQMessageQueue,
    pub(crate) channel: Arc<dyn BrokerChannel>,
    pub(crate) generation: u64,
    pub(crate) consumer_tag: String,
    pub(crate) listening: Arc<AtomicBool>,
    pub(crate) receiver: Arc<dyn MessageReceiver>,
}

/// Spawns the task draining the consumer stream.
///
/// A delivery arriving after the listener went idle is put back on the queue
/// and the consumer is cancelled.
pub(crate) fn spawn_listener(listener: Listener, mut deliveries: DeliveryStream) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(result) = deliveries.next().await {
            match result {
                Ok(delivery) => {
                    if !listener.listening.load(Ordering::SeqCst) {
                        if let Err(err) = listener.channel.nack(delivery.delivery_tag, true).await {
                            error!(error = err.to_string(), "error whiling requeuing msg");
                        }
                        if let Err(err) = listener.channel.cancel(&listener.consumer_tag).await {
                            debug!(error = err.to_string(), "error cancelling consumer");
                        }
                        break;
                    }

                    if let Err(err) = consume(&listener, delivery).await {
                        error!(error = err.to_string(), "error consume msg");
                    }
                }

                Err(err) => error!(error = err.to_string(), "errors consume msg"),
            }
        }

        listener.listening.store(false, Ordering::SeqCst);
        debug!(consumer = listener.consumer_tag.as_str(), "consumer stopped");
    })
}

/// Handles a single pushed delivery.
async fn consume(listener: &Listener, delivery: BrokerDelivery) -> Result<(), AmqpError> {
    let tracer = global::tracer("amqp consumer");
    let msg_type = delivery
        .properties
        .kind()
        .as_ref()
        .map(|v| v.to_string())
        .unwrap_or_default();
    let (parent, span) = otel::new_span(&delivery.properties, &tracer, &msg_type);
    let cx = parent.with_span(span);

    let mut envelope = to_envelope(delivery, Some(listener.generation));
    listener.queue.record_received();

    debug!(
        trace_id = envelope.trace_id.as_deref().unwrap_or_default(),
        "received message {} via {}",
        envelope,
        listener.queue.name()
    );

    // receiver runs inside the consumer span
    let queue: &dyn MessageQueue = &listener.queue;
    let result = listener
        .receiver
        .receive_message(&mut envelope, queue)
        .with_context(cx.clone())
        .await;

    let span = cx.span();
    match result {
        Ok(()) => span.set_status(Status::Ok),
        Err(err) => {
            warn!(
                trace_id = envelope.trace_id.as_deref().unwrap_or_default(),
                error = err.to_string(),
                "receiver failed to process message {}",
                envelope.message_id
            );
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from(err.to_string()),
            });
        }
    }

    if envelope.has_reference() {
        listener.queue.complete(&mut envelope).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::{types::ShortString, BasicProperties};

    #[test]
    fn translates_delivery_and_keeps_token() {
        let delivery = BrokerDelivery {
            delivery_tag: 9,
            redelivered: false,
            properties: BasicProperties::default()
                .with_message_id(ShortString::from("m-1"))
                .with_type(ShortString::from("Created"))
                .with_correlation_id(ShortString::from("trace-1")),
            data: b"payload".to_vec(),
        };

        let envelope = to_envelope(delivery, Some(3));

        assert_eq!(envelope.message_id, "m-1");
        assert_eq!(envelope.message_type, "Created");
        assert_eq!(envelope.trace_id.as_deref(), Some("trace-1"));
        assert_eq!(envelope.message, b"payload".to_vec());
        assert_eq!(envelope.reference(), Some(&DeliveryToken::new(9, 3)));
    }

    #[test]
    fn peeked_delivery_has_no_token() {
        let envelope = to_envelope(BrokerDelivery::default(), None);

        assert!(!envelope.has_reference());
        assert_eq!(envelope.trace_id, None);
        assert_eq!(envelope.message_type, "");
    }
}
