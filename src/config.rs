// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Key/Value Configuration
//!
//! `ConfigParams` is the generic configuration object consumed by the queue and
//! by the connection resolver. Keys are dotted paths (`options.auto_create`,
//! `connection.host`) and every value is stored as a string, converted on read.

use serde_json::Value;
use std::collections::BTreeMap;

/// Flat, dotted key/value configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigParams {
    values: BTreeMap<String, String>,
}

impl ConfigParams {
    pub fn new() -> ConfigParams {
        ConfigParams::default()
    }

    /// Builds a configuration from `(key, value)` pairs.
    ///
    /// # Example
    /// ```
    /// use rabbitmq_queue::config::ConfigParams;
    ///
    /// let cfg = ConfigParams::from_tuples(&[("queue", "orders"), ("options.auto_create", "true")]);
    /// assert_eq!(cfg.get_as_nullable_string("queue"), Some("orders".to_owned()));
    /// ```
    pub fn from_tuples(tuples: &[(&str, &str)]) -> ConfigParams {
        let mut cfg = ConfigParams::default();
        for (key, value) in tuples {
            cfg.set(key, value);
        }
        cfg
    }

    /// Builds a configuration from a JSON document, flattening nested objects
    /// into dotted keys. Arrays are indexed (`hosts.0`, `hosts.1`).
    pub fn from_json(value: &Value) -> ConfigParams {
        let mut cfg = ConfigParams::default();
        flatten_json("", value, &mut cfg.values);
        cfg
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.values.insert(key.to_owned(), value.to_owned());
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(|k| k.as_str())
    }

    /// Returns the keys under `section.` with the prefix stripped.
    pub fn get_section(&self, section: &str) -> ConfigParams {
        let prefix = format!("{}.", section);
        let values = self
            .values
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(&prefix)
                    .map(|stripped| (stripped.to_owned(), v.clone()))
            })
            .collect();

        ConfigParams { values }
    }

    pub fn get_as_nullable_string(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    pub fn get_as_string_with_default(&self, key: &str, default: &str) -> String {
        self.get_as_nullable_string(key)
            .unwrap_or_else(|| default.to_owned())
    }

    pub fn get_as_nullable_boolean(&self, key: &str) -> Option<bool> {
        self.values
            .get(key)
            .and_then(|v| match v.trim().to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" | "t" | "y" => Some(true),
                "false" | "0" | "no" | "off" | "f" | "n" => Some(false),
                _ => None,
            })
    }

    pub fn get_as_boolean_with_default(&self, key: &str, default: bool) -> bool {
        self.get_as_nullable_boolean(key).unwrap_or(default)
    }

    pub fn get_as_nullable_long(&self, key: &str) -> Option<i64> {
        self.values.get(key).and_then(|v| v.trim().parse().ok())
    }

    pub fn get_as_long_with_default(&self, key: &str, default: i64) -> i64 {
        self.get_as_nullable_long(key).unwrap_or(default)
    }
}

fn flatten_json(prefix: &str, value: &Value, out: &mut BTreeMap<String, String>) {
    let join = |key: &str| {
        if prefix.is_empty() {
            key.to_owned()
        } else {
            format!("{}.{}", prefix, key)
        }
    };

    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                flatten_json(&join(key), nested, out);
            }
        }
        Value::Array(items) => {
            for (idx, nested) in items.iter().enumerate() {
                flatten_json(&join(&idx.to_string()), nested, out);
            }
        }
        Value::Null => {}
        Value::String(s) => {
            out.insert(prefix.to_owned(), s.clone());
        }
        other => {
            out.insert(prefix.to_owned(), other.to_string());
        }
    }
}
