// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Queue
//!
//! `RabbitMQMessageQueue` implements the `MessageQueue` contract over a single
//! AMQP channel. It owns the connection lifecycle (open resolves the broker URI,
//! connects and optionally provisions topology), the send/peek/receive surface,
//! acknowledgement of received messages and the push-mode listen loop.
//!
//! Clones share the connection, listener and counters, which is how the listen
//! loop hands the queue to receivers. Open and close are not meant to race each
//! other; callers own that ordering.

use crate::{
    channel::{BrokerChannel, Connector, LapinConnector},
    config::ConfigParams,
    connection::{redact_uri, ConnectionResolver, RabbitMQConnectionResolver},
    consumer::{self, Listener},
    counters::{Counters, NullCounters},
    envelope::{DeliveryToken, MessageEnvelope},
    errors::AmqpError,
    message_queue::{
        Configurable, MessageQueue, MessageReceiver, MessagingCapabilities, Openable,
    },
    options::QueueConfiguration,
    publisher,
    queue::QueueDefinition,
    topology::TopologyPlan,
};
use async_trait::async_trait;
use chrono::Utc;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{Mutex, RwLock},
    task::JoinHandle,
};
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Lower bound of the receive polling interval
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Connection state: either nothing, or a channel together with its connection.
enum ConnectionState {
    Closed,
    Open(OpenChannel),
}

#[derive(Clone)]
struct OpenChannel {
    channel: Arc<dyn BrokerChannel>,
    generation: u64,
    queue: String,
}

struct ListenState {
    consumer_tag: String,
    generation: u64,
    listening: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl ListenState {
    fn is_active(&self) -> bool {
        self.listening.load(Ordering::SeqCst) && !self.handle.is_finished()
    }
}

/// Message queue backed by a RabbitMQ broker.
///
/// # Example
/// ```no_run
/// use rabbitmq_queue::{
///     config::ConfigParams,
///     envelope::MessageEnvelope,
///     message_queue::{Configurable, MessageQueue, Openable},
///     rabbitmq_queue::RabbitMQMessageQueue,
/// };
/// use std::time::Duration;
///
/// # async fn run() -> Result<(), rabbitmq_queue::errors::AmqpError> {
/// let mut queue = RabbitMQMessageQueue::new("orders");
/// queue.configure(&ConfigParams::from_tuples(&[
///     ("queue", "orders"),
///     ("options.auto_create", "true"),
///     ("connection.host", "localhost"),
///     ("credential.username", "guest"),
///     ("credential.password", "guest"),
/// ]))?;
///
/// queue.open(None).await?;
/// queue
///     .send(None, &mut MessageEnvelope::from_string(None, "Created", "{}"))
///     .await?;
///
/// if let Some(mut envelope) = queue.receive(None, Duration::from_secs(5)).await? {
///     queue.complete(&mut envelope).await?;
/// }
/// queue.close(None).await
/// # }
/// ```
#[derive(Clone)]
pub struct RabbitMQMessageQueue {
    name: String,
    options: QueueConfiguration,
    default_resolver: RabbitMQConnectionResolver,
    resolver: Option<Arc<dyn ConnectionResolver>>,
    connector: Arc<dyn Connector>,
    counters: Arc<dyn Counters>,
    state: Arc<RwLock<ConnectionState>>,
    listener: Arc<Mutex<Option<ListenState>>>,
    generations: Arc<AtomicU64>,
}

impl RabbitMQMessageQueue {
    /// Creates a closed queue named `name`, connecting through lapin.
    pub fn new(name: &str) -> RabbitMQMessageQueue {
        RabbitMQMessageQueue {
            name: name.to_owned(),
            options: QueueConfiguration::default(),
            default_resolver: RabbitMQConnectionResolver::new(),
            resolver: None,
            connector: Arc::new(LapinConnector),
            counters: Arc::new(NullCounters),
            state: Arc::new(RwLock::new(ConnectionState::Closed)),
            listener: Arc::new(Mutex::new(None)),
            generations: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Creates and configures a queue in one step.
    pub fn from_config(name: &str, config: &ConfigParams) -> Result<RabbitMQMessageQueue, AmqpError> {
        let mut queue = RabbitMQMessageQueue::new(name);
        queue.configure(config)?;
        Ok(queue)
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    /// Replaces the configuration-based resolver.
    pub fn with_resolver(mut self, resolver: Arc<dyn ConnectionResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_counters(mut self, counters: Arc<dyn Counters>) -> Self {
        self.counters = counters;
        self
    }

    pub fn options(&self) -> &QueueConfiguration {
        &self.options
    }

    /// Name of the queue on the broker; a server-named queue is known once open.
    pub async fn queue_name(&self) -> String {
        match &*self.state.read().await {
            ConnectionState::Open(open) => open.queue.clone(),
            ConnectionState::Closed => self.options.queue.clone(),
        }
    }

    pub(crate) fn record_received(&self) {
        self.counters
            .increment_one(&format!("queue.{}.received_messages", self.name));
    }

    fn record_sent(&self) {
        self.counters
            .increment_one(&format!("queue.{}.sent_messages", self.name));
    }

    fn resolver(&self) -> &dyn ConnectionResolver {
        match &self.resolver {
            Some(resolver) => resolver.as_ref(),
            None => &self.default_resolver,
        }
    }

    /// Returns the open channel or fails with `InvalidStateError`.
    async fn check_open(&self) -> Result<OpenChannel, AmqpError> {
        match &*self.state.read().await {
            ConnectionState::Open(open) => Ok(open.clone()),
            ConnectionState::Closed => Err(AmqpError::InvalidStateError(format!(
                "queue `{}` is not opened",
                self.name
            ))),
        }
    }

    /// Takes the delivery token of `envelope` if it belongs to the open channel.
    ///
    /// A missing token means the message was already completed or abandoned,
    /// a token from an older channel refers to a delivery the broker already
    /// requeued when that channel closed. Both are logged and skipped.
    fn take_token(
        &self,
        open: &OpenChannel,
        envelope: &mut MessageEnvelope,
        operation: &str,
    ) -> Option<DeliveryToken> {
        let Some(token) = envelope.take_reference() else {
            warn!(
                trace_id = envelope.trace_id.as_deref().unwrap_or_default(),
                "cannot {} message {}: no pending delivery, it was already settled or never received",
                operation,
                envelope.message_id
            );
            return None;
        };

        if token.generation() != open.generation {
            warn!(
                trace_id = envelope.trace_id.as_deref().unwrap_or_default(),
                "cannot {} message {}: it was received on a closed channel",
                operation,
                envelope.message_id
            );
            return None;
        }

        Some(token)
    }

    /// Fetches up to `count` deliveries, then gives all of them back.
    ///
    /// Every fetched delivery is released even when a later fetch fails.
    async fn fetch_and_release(
        &self,
        open: &OpenChannel,
        count: usize,
    ) -> Result<Vec<MessageEnvelope>, AmqpError> {
        let mut deliveries = Vec::new();
        let mut fetched = Ok(());
        while deliveries.len() < count {
            match open.channel.get(&open.queue).await {
                Ok(Some(delivery)) => deliveries.push(delivery),
                Ok(None) => break,
                Err(err) => {
                    fetched = Err(err);
                    break;
                }
            }
        }

        let mut released = Ok(());
        for delivery in &deliveries {
            if let Err(err) = open.channel.nack(delivery.delivery_tag, true).await {
                warn!(
                    error = err.to_string(),
                    "failed to release peeked delivery {} on {}",
                    delivery.delivery_tag,
                    self.name
                );
                if released.is_ok() {
                    released = Err(err);
                }
            }
        }

        fetched?;
        released?;

        Ok(deliveries
            .into_iter()
            .map(|delivery| consumer::to_envelope(delivery, None))
            .collect())
    }

    async fn stop_listening(&self, trace_id: Option<&str>) -> Result<(), AmqpError> {
        let Some(listen) = self.listener.lock().await.take() else {
            return Ok(());
        };
        listen.listening.store(false, Ordering::SeqCst);

        if let ConnectionState::Open(open) = &*self.state.read().await {
            if open.generation == listen.generation {
                if let Err(err) = open.channel.cancel(&listen.consumer_tag).await {
                    warn!(
                        trace_id = trace_id.unwrap_or_default(),
                        error = err.to_string(),
                        "error cancelling consumer {}",
                        listen.consumer_tag
                    );
                }
            }
        }

        trace!(
            trace_id = trace_id.unwrap_or_default(),
            "stopped listening messages at {}",
            self.name
        );
        Ok(())
    }
}

impl Configurable for RabbitMQMessageQueue {
    fn configure(&mut self, config: &ConfigParams) -> Result<(), AmqpError> {
        if let Some(name) = config.get_as_nullable_string("name") {
            self.name = name;
        }

        self.options = QueueConfiguration::from_config(config, &self.options);
        self.default_resolver.configure(config);
        Ok(())
    }
}

#[async_trait]
impl Openable for RabbitMQMessageQueue {
    async fn open(&self, trace_id: Option<&str>) -> Result<(), AmqpError> {
        let mut state = self.state.write().await;
        if let ConnectionState::Open(_) = &*state {
            return Ok(());
        }

        self.options.validate()?;

        let resolver = self.resolver();
        let connection = resolver.resolve(trace_id).await?;
        let credential = resolver.lookup(trace_id).await?;
        let uri = resolver.compose(trace_id, &connection, &credential)?.uri;
        let redacted = redact_uri(&uri);

        let connection_name = self
            .options
            .connection_name
            .clone()
            .unwrap_or_else(|| self.name.clone());

        let channel = self
            .connector
            .connect(&uri, &connection_name)
            .await
            .map_err(|err| match err {
                err @ AmqpError::ConnectionError { .. } => err,
                other => AmqpError::ConnectionError {
                    uri: redacted.clone(),
                    reason: other.to_string(),
                },
            })?;

        let declared = match TopologyPlan::for_queue(&self.options)
            .install(channel.as_ref())
            .await
        {
            Ok(declared) => declared,
            Err(err) => {
                if let Err(close_err) = channel.close().await {
                    debug!(error = close_err.to_string(), "error closing failed connection");
                }
                return Err(AmqpError::ConnectionError {
                    uri: redacted,
                    reason: err.to_string(),
                });
            }
        };

        let queue = match (self.options.queue.is_empty(), declared) {
            (true, Some(name)) => name,
            _ => self.options.queue.clone(),
        };

        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        *state = ConnectionState::Open(OpenChannel {
            channel,
            generation,
            queue: queue.clone(),
        });

        debug!(
            trace_id = trace_id.unwrap_or_default(),
            queue = queue.as_str(),
            "connected to rabbitmq broker at {}",
            redacted
        );
        Ok(())
    }

    async fn close(&self, trace_id: Option<&str>) -> Result<(), AmqpError> {
        self.stop_listening(trace_id).await?;

        let previous = {
            let mut state = self.state.write().await;
            std::mem::replace(&mut *state, ConnectionState::Closed)
        };

        if let ConnectionState::Open(open) = previous {
            open.channel.close().await?;
            debug!(
                trace_id = trace_id.unwrap_or_default(),
                "closed queue {}",
                self.name
            );
        }

        Ok(())
    }

    async fn is_open(&self) -> bool {
        matches!(&*self.state.read().await, ConnectionState::Open(_))
    }
}

#[async_trait]
impl MessageQueue for RabbitMQMessageQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> MessagingCapabilities {
        MessagingCapabilities {
            message_count: true,
            send: true,
            receive: true,
            peek: true,
            peek_batch: true,
            renew_lock: false,
            abandon: true,
            dead_letter: false,
            clear: true,
        }
    }

    async fn read_message_count(&self) -> Result<u32, AmqpError> {
        let open = self.check_open().await?;
        if open.queue.is_empty() {
            return Ok(0);
        }

        let declared = open
            .channel
            .declare_queue(&QueueDefinition::new(&open.queue).passive())
            .await?;
        Ok(declared.message_count)
    }

    async fn send(
        &self,
        trace_id: Option<&str>,
        envelope: &mut MessageEnvelope,
    ) -> Result<(), AmqpError> {
        let open = self.check_open().await?;

        if envelope.message_id.is_empty() {
            envelope.message_id = Uuid::new_v4().to_string();
        }
        envelope.sent_time = Utc::now();

        let (exchange, routing_key) = if self.options.exchange.is_empty() {
            ("", open.queue.as_str())
        } else {
            (
                self.options.exchange.as_str(),
                self.options.routing_key_for(&open.queue),
            )
        };

        self.record_sent();
        debug!(
            trace_id = trace_id.unwrap_or_default(),
            "sent message {} via {}",
            envelope,
            self.name
        );

        if let Err(err) = publisher::publish(
            open.channel.as_ref(),
            exchange,
            routing_key,
            envelope,
            self.options.persistent,
        )
        .await
        {
            warn!(
                trace_id = trace_id.unwrap_or_default(),
                error = err.to_string(),
                "message {} was not accepted by {}",
                envelope.message_id,
                self.name
            );
        }

        Ok(())
    }

    async fn peek(&self, trace_id: Option<&str>) -> Result<Option<MessageEnvelope>, AmqpError> {
        let open = self.check_open().await?;
        let envelope = self.fetch_and_release(&open, 1).await?.into_iter().next();

        if let Some(envelope) = &envelope {
            trace!(
                trace_id = trace_id.unwrap_or_default(),
                "peeked message {} on {}",
                envelope,
                self.name
            );
        }

        Ok(envelope)
    }

    async fn peek_batch(
        &self,
        trace_id: Option<&str>,
        count: usize,
    ) -> Result<Vec<MessageEnvelope>, AmqpError> {
        let open = self.check_open().await?;
        let envelopes = self.fetch_and_release(&open, count).await?;

        trace!(
            trace_id = trace_id.unwrap_or_default(),
            "peeked {} messages on {}",
            envelopes.len(),
            self.name
        );

        Ok(envelopes)
    }

    async fn receive(
        &self,
        trace_id: Option<&str>,
        wait_timeout: Duration,
    ) -> Result<Option<MessageEnvelope>, AmqpError> {
        let open = self.check_open().await?;
        let interval = self.options.interval.max(MIN_POLL_INTERVAL);
        let mut remaining = wait_timeout;

        while !remaining.is_zero() {
            if let Some(delivery) = open.channel.get(&open.queue).await? {
                let envelope = consumer::to_envelope(delivery, Some(open.generation));
                self.record_received();
                debug!(
                    trace_id = trace_id.unwrap_or_default(),
                    "received message {} via {}",
                    envelope,
                    self.name
                );
                return Ok(Some(envelope));
            }

            tokio::time::sleep(interval.min(remaining)).await;
            remaining = remaining.saturating_sub(interval);
        }

        Ok(None)
    }

    async fn renew_lock(
        &self,
        _envelope: &mut MessageEnvelope,
        _lock_timeout: Duration,
    ) -> Result<(), AmqpError> {
        // AMQP has no visibility timeout to extend
        Ok(())
    }

    async fn complete(&self, envelope: &mut MessageEnvelope) -> Result<(), AmqpError> {
        let open = self.check_open().await?;
        let Some(token) = self.take_token(&open, envelope, "complete") else {
            return Ok(());
        };

        open.channel.ack(token.delivery_tag()).await?;
        trace!(
            trace_id = envelope.trace_id.as_deref().unwrap_or_default(),
            "completed message {} at {}",
            envelope,
            self.name
        );
        Ok(())
    }

    async fn abandon(&self, envelope: &mut MessageEnvelope) -> Result<(), AmqpError> {
        let open = self.check_open().await?;
        let Some(token) = self.take_token(&open, envelope, "abandon") else {
            return Ok(());
        };

        open.channel.nack(token.delivery_tag(), true).await?;
        trace!(
            trace_id = envelope.trace_id.as_deref().unwrap_or_default(),
            "abandoned message {} at {}",
            envelope,
            self.name
        );
        Ok(())
    }

    async fn move_to_dead_letter(
        &self,
        _envelope: &mut MessageEnvelope,
    ) -> Result<(), AmqpError> {
        // Dead-lettering is not available through this binding
        Ok(())
    }

    async fn listen(
        &self,
        trace_id: Option<&str>,
        receiver: Arc<dyn MessageReceiver>,
    ) -> Result<(), AmqpError> {
        let open = self.check_open().await?;

        let mut listener = self.listener.lock().await;
        if listener.as_ref().is_some_and(ListenState::is_active) {
            return Err(AmqpError::InvalidStateError(format!(
                "queue `{}` is already listening",
                self.name
            )));
        }

        let consumer_tag = format!("{}-{}", self.name, Uuid::new_v4());
        let deliveries = open.channel.consume(&open.queue, &consumer_tag).await?;
        let listening = Arc::new(AtomicBool::new(true));

        let handle = consumer::spawn_listener(
            Listener {
                queue: self.clone(),
                channel: open.channel.clone(),
                generation: open.generation,
                consumer_tag: consumer_tag.clone(),
                listening: listening.clone(),
                receiver,
            },
            deliveries,
        );

        *listener = Some(ListenState {
            consumer_tag,
            generation: open.generation,
            listening,
            handle,
        });

        trace!(
            trace_id = trace_id.unwrap_or_default(),
            "started listening messages at {}",
            self.name
        );
        Ok(())
    }

    async fn end_listen(&self, trace_id: Option<&str>) -> Result<(), AmqpError> {
        self.stop_listening(trace_id).await
    }

    async fn clear(&self, trace_id: Option<&str>) -> Result<(), AmqpError> {
        let open = self.check_open().await?;
        if open.queue.is_empty() {
            return Ok(());
        }

        let count = open.channel.purge(&open.queue).await?;
        debug!(
            trace_id = trace_id.unwrap_or_default(),
            "cleared {} messages in queue {}",
            count,
            self.name
        );
        Ok(())
    }
}

#[cfg(test)]
#[path = "rabbitmq_queue_tests.rs"]
mod tests;
