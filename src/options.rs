// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Configuration
//!
//! Addressing and behavior flags of a queue, read from `ConfigParams`.

use crate::{config::ConfigParams, errors::AmqpError, exchange::ExchangeKind};
use std::time::Duration;

/// Default receive polling interval in milliseconds
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 10_000;

/// Where a queue publishes to and consumes from, and how its topology is
/// provisioned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfiguration {
    pub queue: String,
    pub exchange: String,
    pub exchange_type: ExchangeKind,
    pub routing_key: Option<String>,
    pub persistent: bool,
    pub exclusive: bool,
    pub auto_create: bool,
    pub auto_delete: bool,
    pub no_queue: bool,
    pub interval: Duration,
    pub connection_name: Option<String>,
}

impl Default for QueueConfiguration {
    fn default() -> Self {
        QueueConfiguration {
            queue: String::new(),
            exchange: String::new(),
            exchange_type: ExchangeKind::default(),
            routing_key: None,
            persistent: false,
            exclusive: false,
            auto_create: false,
            auto_delete: false,
            no_queue: false,
            interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            connection_name: None,
        }
    }
}

impl QueueConfiguration {
    /// Reads the configuration, keeping the current values for absent keys.
    pub fn from_config(cfg: &ConfigParams, current: &QueueConfiguration) -> QueueConfiguration {
        let exchange_type = match cfg.get_as_nullable_string("options.exchange_type") {
            Some(kind) => kind.parse().unwrap_or_default(),
            None => current.exchange_type.clone(),
        };

        let interval = cfg
            .get_as_nullable_long("interval")
            .filter(|ms| *ms >= 0)
            .map(|ms| Duration::from_millis(ms as u64))
            .unwrap_or(current.interval);

        QueueConfiguration {
            queue: cfg.get_as_string_with_default("queue", &current.queue),
            exchange: cfg.get_as_string_with_default("exchange", &current.exchange),
            exchange_type,
            routing_key: cfg
                .get_as_nullable_string("options.routing_key")
                .filter(|k| !k.is_empty())
                .or_else(|| current.routing_key.clone()),
            persistent: cfg.get_as_boolean_with_default("options.persistent", current.persistent),
            exclusive: cfg.get_as_boolean_with_default("options.exclusive", current.exclusive),
            auto_create: cfg
                .get_as_boolean_with_default("options.auto_create", current.auto_create),
            auto_delete: cfg
                .get_as_boolean_with_default("options.auto_delete", current.auto_delete),
            no_queue: cfg.get_as_boolean_with_default("options.no_queue", current.no_queue),
            interval,
            connection_name: cfg
                .get_as_nullable_string("options.connection_name")
                .or_else(|| current.connection_name.clone()),
        }
    }

    /// At least one of `queue` or `exchange` must be set.
    pub fn validate(&self) -> Result<(), AmqpError> {
        if self.queue.is_empty() && self.exchange.is_empty() {
            return Err(AmqpError::ConfigurationError(
                "queue or exchange are not defined in connection parameters".to_owned(),
            ));
        }

        Ok(())
    }

    /// Routing key used for publishing and binding, falling back to the queue name.
    pub fn routing_key_for<'a>(&'a self, queue: &'a str) -> &'a str {
        match &self.routing_key {
            Some(key) => key,
            None => queue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_all_keys() {
        let cfg = ConfigParams::from_tuples(&[
            ("queue", "orders"),
            ("exchange", "events"),
            ("options.exchange_type", "topic"),
            ("options.routing_key", "orders.*"),
            ("options.persistent", "true"),
            ("options.exclusive", "true"),
            ("options.auto_create", "true"),
            ("options.auto_delete", "true"),
            ("options.no_queue", "false"),
            ("interval", "250"),
        ]);

        let opts = QueueConfiguration::from_config(&cfg, &QueueConfiguration::default());

        assert_eq!(opts.queue, "orders");
        assert_eq!(opts.exchange, "events");
        assert_eq!(opts.exchange_type, ExchangeKind::Topic);
        assert_eq!(opts.routing_key_for(&opts.queue), "orders.*");
        assert!(opts.persistent && opts.exclusive && opts.auto_create && opts.auto_delete);
        assert!(!opts.no_queue);
        assert_eq!(opts.interval, Duration::from_millis(250));
    }

    #[test]
    fn defaults_and_routing_key_fallback() {
        let opts =
            QueueConfiguration::from_config(&ConfigParams::new(), &QueueConfiguration::default());

        assert_eq!(opts.exchange_type, ExchangeKind::Fanout);
        assert_eq!(opts.interval, Duration::from_millis(DEFAULT_POLL_INTERVAL_MS));
        assert_eq!(opts.routing_key_for("orders"), "orders");
    }

    #[test]
    fn keeps_current_values_for_missing_keys() {
        let current = QueueConfiguration {
            queue: "orders".to_owned(),
            auto_create: true,
            ..Default::default()
        };

        let opts =
            QueueConfiguration::from_config(&ConfigParams::from_tuples(&[("exchange", "ex")]), &current);

        assert_eq!(opts.queue, "orders");
        assert_eq!(opts.exchange, "ex");
        assert!(opts.auto_create);
    }

    #[test]
    fn requires_queue_or_exchange() {
        assert!(matches!(
            QueueConfiguration::default().validate(),
            Err(AmqpError::ConfigurationError(_))
        ));

        let exchange_only = QueueConfiguration {
            exchange: "events".to_owned(),
            ..Default::default()
        };
        assert_eq!(exchange_only.validate(), Ok(()));
    }
}
