// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker implementing the channel seam, for tests that need real
//! queue semantics (requeue, redelivery, push consumers) without RabbitMQ.

use crate::{
    channel::{BrokerChannel, BrokerDelivery, Connector, DeclaredQueue, DeliveryStream},
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use lapin::BasicProperties;
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};
use tokio::sync::mpsc;

#[derive(Clone)]
struct StoredMessage {
    seq: u64,
    properties: BasicProperties,
    data: Vec<u8>,
    redelivered: bool,
}

struct Unacked {
    channel_id: u64,
    queue: String,
    message: StoredMessage,
}

struct Consumer {
    channel_id: u64,
    queue: String,
    sender: mpsc::UnboundedSender<Result<BrokerDelivery, AmqpError>>,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, Vec<StoredMessage>>,
    exchanges: HashMap<String, ExchangeKind>,
    bindings: Vec<QueueBinding>,
    unacked: BTreeMap<u64, Unacked>,
    consumers: BTreeMap<String, Consumer>,
    next_seq: u64,
    next_tag: u64,
    next_channel: u64,
    generated_queues: u64,
    published: u64,
}

impl BrokerState {
    /// Hands ready messages of `queue` to its first consumer, if any.
    fn dispatch(&mut self, queue: &str) {
        let Some((channel_id, sender)) = self
            .consumers
            .values()
            .find(|c| c.queue == queue)
            .map(|c| (c.channel_id, c.sender.clone()))
        else {
            return;
        };

        let ready = std::mem::take(self.queues.entry(queue.to_owned()).or_default());
        for message in ready {
            self.next_tag += 1;
            let tag = self.next_tag;
            let delivery = BrokerDelivery {
                delivery_tag: tag,
                redelivered: message.redelivered,
                properties: message.properties.clone(),
                data: message.data.clone(),
            };
            self.unacked.insert(
                tag,
                Unacked {
                    channel_id,
                    queue: queue.to_owned(),
                    message,
                },
            );
            let _ = sender.send(Ok(delivery));
        }
    }

    fn requeue(&mut self, queue: &str, mut message: StoredMessage) {
        message.redelivered = true;
        let ready = self.queues.entry(queue.to_owned()).or_default();
        let pos = ready.partition_point(|m| m.seq < message.seq);
        ready.insert(pos, message);
        self.dispatch(queue);
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Vec<String> {
        if exchange.is_empty() {
            return if self.queues.contains_key(routing_key) {
                vec![routing_key.to_owned()]
            } else {
                vec![]
            };
        }

        let fanout = matches!(self.exchanges.get(exchange), Some(ExchangeKind::Fanout));
        self.bindings
            .iter()
            .filter(|b| b.exchange_name == exchange && (fanout || b.routing_key == routing_key))
            .map(|b| b.queue_name.clone())
            .collect()
    }
}

/// Shared broker state; every connection made through it sees the same queues.
#[derive(Clone, Default)]
pub(crate) struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub(crate) fn new() -> InMemoryBroker {
        InMemoryBroker::default()
    }

    pub(crate) fn with_queue(self, name: &str) -> InMemoryBroker {
        self.state
            .lock()
            .unwrap()
            .queues
            .insert(name.to_owned(), Vec::new());
        self
    }

    pub(crate) fn ready_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .map(Vec::len)
            .unwrap_or_default()
    }

    pub(crate) fn unacked_count(&self) -> usize {
        self.state.lock().unwrap().unacked.len()
    }

    pub(crate) fn consumer_count(&self) -> usize {
        self.state.lock().unwrap().consumers.len()
    }

    pub(crate) fn has_exchange(&self, name: &str) -> bool {
        self.state.lock().unwrap().exchanges.contains_key(name)
    }

    pub(crate) fn bindings(&self) -> Vec<QueueBinding> {
        self.state.lock().unwrap().bindings.clone()
    }

    pub(crate) fn published(&self) -> u64 {
        self.state.lock().unwrap().published
    }

    pub(crate) fn connector(&self) -> Arc<InMemoryConnector> {
        Arc::new(InMemoryConnector {
            broker: self.clone(),
            uris: Mutex::new(Vec::new()),
        })
    }
}

pub(crate) struct InMemoryConnector {
    broker: InMemoryBroker,
    uris: Mutex<Vec<String>>,
}

impl InMemoryConnector {
    pub(crate) fn connected_uris(&self) -> Vec<String> {
        self.uris.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for InMemoryConnector {
    async fn connect(
        &self,
        uri: &str,
        _connection_name: &str,
    ) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        self.uris.lock().unwrap().push(uri.to_owned());

        let mut state = self.broker.state.lock().unwrap();
        state.next_channel += 1;
        Ok(Arc::new(InMemoryChannel {
            id: state.next_channel,
            broker: self.broker.clone(),
        }))
    }
}

struct InMemoryChannel {
    id: u64,
    broker: InMemoryBroker,
}

impl InMemoryChannel {
    fn state(&self) -> std::sync::MutexGuard<'_, BrokerState> {
        self.broker.state.lock().unwrap()
    }

    fn settle(&self, delivery_tag: u64) -> Result<Unacked, AmqpError> {
        let mut state = self.state();
        match state.unacked.get(&delivery_tag) {
            Some(u) if u.channel_id == self.id => Ok(state
                .unacked
                .remove(&delivery_tag)
                .expect("present")),
            _ => Err(AmqpError::AckMessageError),
        }
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.state()
            .exchanges
            .insert(def.name.clone(), def.kind.clone());
        Ok(())
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<DeclaredQueue, AmqpError> {
        let mut state = self.state();
        let name = if def.name.is_empty() {
            state.generated_queues += 1;
            format!("amq.gen-{}", state.generated_queues)
        } else {
            def.name.clone()
        };

        if def.passive && !state.queues.contains_key(&name) {
            return Err(AmqpError::DeclareQueueError(name));
        }

        let count = state.queues.entry(name.clone()).or_default().len() as u32;
        Ok(DeclaredQueue {
            name,
            message_count: count,
        })
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let mut state = self.state();
        if !state.exchanges.contains_key(&binding.exchange_name) {
            return Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange_name.clone(),
                binding.queue_name.clone(),
            ));
        }
        state.bindings.push(binding.clone());
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let mut state = self.state();
        state.published += 1;

        for queue in state.route(exchange, routing_key) {
            state.next_seq += 1;
            let message = StoredMessage {
                seq: state.next_seq,
                properties: properties.clone(),
                data: payload.to_vec(),
                redelivered: false,
            };
            state.queues.entry(queue.clone()).or_default().push(message);
            state.dispatch(&queue);
        }

        Ok(())
    }

    async fn get(&self, queue: &str) -> Result<Option<BrokerDelivery>, AmqpError> {
        let mut state = self.state();
        let Some(ready) = state.queues.get_mut(queue) else {
            return Err(AmqpError::GetMessageError(queue.to_owned()));
        };
        if ready.is_empty() {
            return Ok(None);
        }

        let message = ready.remove(0);
        state.next_tag += 1;
        let tag = state.next_tag;
        let delivery = BrokerDelivery {
            delivery_tag: tag,
            redelivered: message.redelivered,
            properties: message.properties.clone(),
            data: message.data.clone(),
        };
        state.unacked.insert(
            tag,
            Unacked {
                channel_id: self.id,
                queue: queue.to_owned(),
                message,
            },
        );

        Ok(Some(delivery))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.settle(delivery_tag).map(|_| ())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        let unacked = self
            .settle(delivery_tag)
            .map_err(|_| AmqpError::NackMessageError)?;
        if requeue {
            self.state().requeue(&unacked.queue, unacked.message);
        }
        Ok(())
    }

    async fn purge(&self, queue: &str) -> Result<u32, AmqpError> {
        let mut state = self.state();
        match state.queues.get_mut(queue) {
            Some(ready) => {
                let count = ready.len() as u32;
                ready.clear();
                Ok(count)
            }
            None => Err(AmqpError::PurgeQueueError(queue.to_owned())),
        }
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        {
            let mut state = self.state();
            if !state.queues.contains_key(queue) {
                return Err(AmqpError::ConsumerDeclarationError(queue.to_owned()));
            }
            state.consumers.insert(
                consumer_tag.to_owned(),
                Consumer {
                    channel_id: self.id,
                    queue: queue.to_owned(),
                    sender,
                },
            );
            state.dispatch(queue);
        }

        Ok(stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|delivery| (delivery, receiver))
        })
        .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.state().consumers.remove(consumer_tag);
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let mut state = self.state();
        state.consumers.retain(|_, c| c.channel_id != self.id);

        let tags: Vec<u64> = state
            .unacked
            .iter()
            .filter(|(_, u)| u.channel_id == self.id)
            .map(|(tag, _)| *tag)
            .collect();
        for tag in tags {
            if let Some(unacked) = state.unacked.remove(&tag) {
                state.requeue(&unacked.queue, unacked.message);
            }
        }

        Ok(())
    }
}
