// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! RabbitMQ implementation of a generic message queue.
//!
//! The entry point is [`rabbitmq_queue::RabbitMQMessageQueue`], configured from
//! [`config::ConfigParams`] and driven through the traits in [`message_queue`].

mod consumer;
mod otel;
mod publisher;

pub mod channel;
pub mod config;
pub mod connection;
pub mod counters;
pub mod envelope;
pub mod errors;
pub mod exchange;
pub mod message_queue;
pub mod options;
pub mod queue;
pub mod rabbitmq_queue;
pub mod topology;

#[cfg(test)]
mod testing;
