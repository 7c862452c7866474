// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module handles the creation and management of AMQP connections and channels.
//! The queue talks to the broker only through the `Connector` and `BrokerChannel`
//! traits; `LapinConnector` is the production implementation that establishes a
//! lapin connection and opens a single channel over it.

use crate::{
    connection::redact_uri,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{stream::BoxStream, StreamExt};
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicGetOptions,
        BasicNackOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions, QueuePurgeOptions,
    },
    types::{FieldTable, LongString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tracing::{debug, error};

/// AMQP reply code for a normal shutdown
const REPLY_SUCCESS: u16 = 200;

/// A message handed over by the broker, either fetched or pushed to a consumer.
#[derive(Debug, Clone, Default)]
pub struct BrokerDelivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
}

impl From<Delivery> for BrokerDelivery {
    fn from(delivery: Delivery) -> Self {
        BrokerDelivery {
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            properties: delivery.properties,
            data: delivery.data,
        }
    }
}

/// Result of a queue declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeclaredQueue {
    pub name: String,
    pub message_count: u32,
}

/// Stream of deliveries pushed to a consumer.
pub type DeliveryStream = BoxStream<'static, Result<BrokerDelivery, AmqpError>>;

/// The AMQP 0-9-1 operations the queue performs over an open channel.
///
/// Implementations own both the transport connection and the channel, so a
/// value of this type is the "open" half of the queue's connection state.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<DeclaredQueue, AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;

    /// Fetches one message without blocking; the delivery stays unacknowledged.
    async fn get(&self, queue: &str) -> Result<Option<BrokerDelivery>, AmqpError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    /// Removes all ready messages and returns how many were purged.
    async fn purge(&self, queue: &str) -> Result<u32, AmqpError>;

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    /// Closes the channel, then the connection.
    async fn close(&self) -> Result<(), AmqpError>;
}

/// Establishes a connection and a channel over it.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        uri: &str,
        connection_name: &str,
    ) -> Result<Arc<dyn BrokerChannel>, AmqpError>;
}

/// Connector backed by lapin.
#[derive(Debug, Clone, Default)]
pub struct LapinConnector;

#[async_trait]
impl Connector for LapinConnector {
    async fn connect(
        &self,
        uri: &str,
        connection_name: &str,
    ) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let (connection, channel) = new_amqp_channel(uri, connection_name).await?;
        Ok(Arc::new(LapinChannel {
            connection,
            channel,
        }))
    }
}

/// Creates a new AMQP connection and a channel on it.
///
/// # Parameters
/// * `uri` - The `amqp://` URI of the broker
/// * `connection_name` - Name reported to the broker for this connection
pub async fn new_amqp_channel(
    uri: &str,
    connection_name: &str,
) -> Result<(Connection, Channel), AmqpError> {
    debug!("creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(connection_name.to_owned()));

    let conn = match Connection::connect(uri, options).await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(AmqpError::ConnectionError {
                uri: redact_uri(uri),
                reason: err.to_string(),
            })
        }
    }?;
    debug!("amqp connected");

    debug!("creating amqp channel...");
    match conn.create_channel().await {
        Ok(c) => {
            debug!("channel created");
            Ok((conn, c))
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            if let Err(close_err) = conn.close(REPLY_SUCCESS, "OK").await {
                debug!(error = close_err.to_string(), "error closing connection");
            }
            Err(AmqpError::ChannelError(err.to_string()))
        }
    }
}

/// A lapin connection together with the channel opened over it.
pub struct LapinChannel {
    connection: Connection,
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(
                &def.name,
                (&def.kind).into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the exchange"
                );
                AmqpError::DeclareExchangeError(def.name.clone())
            })
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<DeclaredQueue, AmqpError> {
        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Ok(queue) => Ok(DeclaredQueue {
                name: queue.name().to_string(),
                message_count: queue.message_count(),
            }),
            Err(err) => {
                error!(error = err.to_string(), name = def.name.as_str(), "error to declare the queue");
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                )
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                properties,
            )
            .await
            .map_err(|err| AmqpError::PublishingError(err.to_string()))?;

        confirm
            .await
            .map(|_| ())
            .map_err(|err| AmqpError::PublishingError(err.to_string()))
    }

    async fn get(&self, queue: &str) -> Result<Option<BrokerDelivery>, AmqpError> {
        self.channel
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await
            .map(|msg| msg.map(|m| BrokerDelivery::from(m.delivery)))
            .map_err(|err| {
                error!(error = err.to_string(), queue, "error to get message");
                AmqpError::GetMessageError(queue.to_owned())
            })
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }

    async fn purge(&self, queue: &str) -> Result<u32, AmqpError> {
        self.channel
            .queue_purge(queue, QueuePurgeOptions { nowait: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), queue, "error to purge queue");
                AmqpError::PurgeQueueError(queue.to_owned())
            })
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                AmqpError::ConsumerDeclarationError(err.to_string())
            })?;

        Ok(consumer
            .map(|result| {
                result
                    .map(BrokerDelivery::from)
                    .map_err(|err| AmqpError::ConsumerError(err.to_string()))
            })
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
            .map_err(|err| AmqpError::ConsumerError(err.to_string()))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        debug!("closing amqp channel...");
        let channel_result = self.channel.close(REPLY_SUCCESS, "OK").await;

        debug!("closing amqp connection...");
        self.connection
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| AmqpError::CloseError(err.to_string()))?;

        channel_result.map_err(|err| AmqpError::CloseError(err.to_string()))
    }
}
