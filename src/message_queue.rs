// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Queue Contract
//!
//! Transport-agnostic traits implemented by the RabbitMQ queue, so application
//! code can send, receive and listen without depending on the broker.

use crate::{config::ConfigParams, envelope::MessageEnvelope, errors::AmqpError};
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};

/// Components with an open/close lifecycle.
#[async_trait]
pub trait Openable: Send + Sync {
    /// Opens the component. Opening an already open component does nothing.
    async fn open(&self, trace_id: Option<&str>) -> Result<(), AmqpError>;

    /// Closes the component. Closing an already closed component does nothing.
    async fn close(&self, trace_id: Option<&str>) -> Result<(), AmqpError>;

    async fn is_open(&self) -> bool;
}

/// Components configured from `ConfigParams`.
pub trait Configurable {
    fn configure(&mut self, config: &ConfigParams) -> Result<(), AmqpError>;
}

/// Which operations a queue implementation actually supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessagingCapabilities {
    pub message_count: bool,
    pub send: bool,
    pub receive: bool,
    pub peek: bool,
    pub peek_batch: bool,
    pub renew_lock: bool,
    pub abandon: bool,
    pub dead_letter: bool,
    pub clear: bool,
}

/// Callback invoked by `listen` for every delivered message.
///
/// The receiver may call `complete` or `abandon` on `queue`; if it does
/// neither, the message is acknowledged once the callback returns, whatever
/// its result.
#[async_trait]
pub trait MessageReceiver: Send + Sync {
    async fn receive_message(
        &self,
        envelope: &mut MessageEnvelope,
        queue: &dyn MessageQueue,
    ) -> Result<(), AmqpError>;
}

/// Generic message queue.
#[async_trait]
pub trait MessageQueue: Openable {
    fn name(&self) -> &str;

    fn capabilities(&self) -> MessagingCapabilities;

    /// Number of messages ready in the queue.
    async fn read_message_count(&self) -> Result<u32, AmqpError>;

    /// Publishes a message. Broker-side rejection is logged, not returned.
    async fn send(
        &self,
        trace_id: Option<&str>,
        envelope: &mut MessageEnvelope,
    ) -> Result<(), AmqpError>;

    /// Returns the next message without removing it, or `None` when empty.
    async fn peek(&self, trace_id: Option<&str>) -> Result<Option<MessageEnvelope>, AmqpError>;

    /// Returns up to `count` messages without removing them, in queue order.
    async fn peek_batch(
        &self,
        trace_id: Option<&str>,
        count: usize,
    ) -> Result<Vec<MessageEnvelope>, AmqpError>;

    /// Waits up to `wait_timeout` for a message. `None` means nothing arrived.
    async fn receive(
        &self,
        trace_id: Option<&str>,
        wait_timeout: Duration,
    ) -> Result<Option<MessageEnvelope>, AmqpError>;

    async fn renew_lock(
        &self,
        envelope: &mut MessageEnvelope,
        lock_timeout: Duration,
    ) -> Result<(), AmqpError>;

    /// Permanently removes a received message.
    async fn complete(&self, envelope: &mut MessageEnvelope) -> Result<(), AmqpError>;

    /// Returns a received message to the queue for redelivery.
    async fn abandon(&self, envelope: &mut MessageEnvelope) -> Result<(), AmqpError>;

    async fn move_to_dead_letter(&self, envelope: &mut MessageEnvelope)
        -> Result<(), AmqpError>;

    /// Starts pushing incoming messages to `receiver`.
    async fn listen(
        &self,
        trace_id: Option<&str>,
        receiver: Arc<dyn MessageReceiver>,
    ) -> Result<(), AmqpError>;

    /// Stops pushing messages. An in-flight callback is not interrupted.
    async fn end_listen(&self, trace_id: Option<&str>) -> Result<(), AmqpError>;

    /// Removes all ready messages.
    async fn clear(&self, trace_id: Option<&str>) -> Result<(), AmqpError>;
}
