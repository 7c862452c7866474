// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module separates what to provision from how to talk to the broker.
//! `TopologyPlan::for_queue` is a pure function from a `QueueConfiguration` to an
//! ordered list of declare/bind steps, and `TopologyPlan::install` executes those
//! steps over a `BrokerChannel`.
//!
//! The main components are:
//! - `TopologyStep`: a single exchange declaration, queue declaration or binding
//! - `TopologyPlan`: ordered steps plus the builder used to assemble them

use crate::{
    channel::BrokerChannel,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    options::QueueConfiguration,
    queue::{QueueBinding, QueueDefinition},
};
use tracing::debug;

/// One provisioning step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyStep {
    DeclareExchange(ExchangeDefinition),
    DeclareQueue(QueueDefinition),
    BindQueue(QueueBinding),
}

/// Ordered provisioning steps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologyPlan {
    steps: Vec<TopologyStep>,
}

impl TopologyPlan {
    pub fn new() -> TopologyPlan {
        TopologyPlan::default()
    }

    /// Builds the steps needed by a queue configured with `auto_create`.
    ///
    /// Without `auto_create` the plan is empty and the topology is assumed to
    /// exist. With an empty queue name a server-named exclusive queue is
    /// declared and the binding follows whatever name the broker assigns.
    pub fn for_queue(opts: &QueueConfiguration) -> TopologyPlan {
        let mut plan = TopologyPlan::new();
        if !opts.auto_create {
            return plan;
        }

        if !opts.exchange.is_empty() {
            let mut exchange =
                ExchangeDefinition::new(&opts.exchange).kind(opts.exchange_type.clone());
            if opts.persistent {
                exchange = exchange.durable();
            }
            if opts.auto_delete {
                exchange = exchange.delete();
            }
            plan = plan.exchange(exchange);
        }

        if opts.no_queue {
            return plan;
        }

        let queue = if opts.queue.is_empty() {
            QueueDefinition::anonymous()
        } else {
            let mut queue = QueueDefinition::new(&opts.queue);
            if opts.persistent {
                queue = queue.durable();
            }
            if opts.exclusive {
                queue = queue.exclusive();
            }
            if opts.auto_delete {
                queue = queue.delete();
            }
            queue
        };
        plan = plan.queue(queue);

        if !opts.exchange.is_empty() {
            plan = plan.queue_binding(
                QueueBinding::new(&opts.queue)
                    .exchange(&opts.exchange)
                    .routing_key(opts.routing_key.as_deref().unwrap_or_default()),
            );
        }

        plan
    }

    /// Adds an exchange definition to the plan.
    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.steps.push(TopologyStep::DeclareExchange(def));
        self
    }

    /// Adds a queue definition to the plan.
    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.steps.push(TopologyStep::DeclareQueue(def));
        self
    }

    /// Adds a queue-to-exchange binding to the plan.
    pub fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.steps.push(TopologyStep::BindQueue(binding));
        self
    }

    pub fn steps(&self) -> &[TopologyStep] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Installs the plan on the broker, in order.
    ///
    /// Returns the name of the last declared queue as reported by the broker,
    /// which is how a server-named queue gets adopted. A binding with an empty
    /// queue name or routing key uses that declared name.
    pub async fn install(&self, channel: &dyn BrokerChannel) -> Result<Option<String>, AmqpError> {
        let mut declared: Option<String> = None;

        for step in &self.steps {
            match step {
                TopologyStep::DeclareExchange(def) => {
                    debug!("creating exchange: {}", def.name);
                    channel.declare_exchange(def).await?;
                    debug!("exchange: {} was created", def.name);
                }
                TopologyStep::DeclareQueue(def) => {
                    debug!("creating queue: {}", def.name);
                    let queue = channel.declare_queue(def).await?;
                    debug!("queue: {} was created", queue.name);
                    declared = Some(queue.name);
                }
                TopologyStep::BindQueue(binding) => {
                    let queue_name = match (&declared, binding.queue_name.is_empty()) {
                        (Some(name), true) => name.clone(),
                        _ => binding.queue_name.clone(),
                    };
                    let routing_key = if binding.routing_key.is_empty() {
                        queue_name.clone()
                    } else {
                        binding.routing_key.clone()
                    };

                    debug!(
                        "binding queue: {} to the exchange: {} with the key: {}",
                        queue_name, binding.exchange_name, routing_key
                    );

                    channel
                        .bind_queue(
                            &QueueBinding::new(&queue_name)
                                .exchange(&binding.exchange_name)
                                .routing_key(&routing_key),
                        )
                        .await?;
                }
            }
        }

        Ok(declared)
    }
}
