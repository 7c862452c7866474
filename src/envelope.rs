// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelope
//!
//! The application-level wrapper around a payload: identifiers, type tag, trace
//! id and the delivery token used to acknowledge the broker delivery it came from.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Payload characters shown by `Display`
const PREVIEW_LENGTH: usize = 50;

/// Handle to an unacknowledged broker delivery.
///
/// The token is not `Clone`: it is consumed exactly once, by `complete` or
/// `abandon`. `generation` identifies the channel the delivery arrived on,
/// since delivery tags are only meaningful on that channel.
#[derive(Debug, PartialEq, Eq)]
pub struct DeliveryToken {
    delivery_tag: u64,
    generation: u64,
}

impl DeliveryToken {
    pub(crate) fn new(delivery_tag: u64, generation: u64) -> DeliveryToken {
        DeliveryToken {
            delivery_tag,
            generation,
        }
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// A message with its metadata.
#[derive(Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub trace_id: Option<String>,
    pub message_id: String,
    pub message_type: String,
    pub sent_time: DateTime<Utc>,
    pub message: Vec<u8>,
    #[serde(skip)]
    reference: Option<DeliveryToken>,
}

/// Clones never carry the delivery token, only the envelope handed out by the
/// queue can complete or abandon its delivery.
impl Clone for MessageEnvelope {
    fn clone(&self) -> Self {
        MessageEnvelope {
            trace_id: self.trace_id.clone(),
            message_id: self.message_id.clone(),
            message_type: self.message_type.clone(),
            sent_time: self.sent_time,
            message: self.message.clone(),
            reference: None,
        }
    }
}

impl MessageEnvelope {
    /// Creates an envelope with a fresh message id.
    pub fn new(trace_id: Option<&str>, message_type: &str, message: Vec<u8>) -> MessageEnvelope {
        MessageEnvelope {
            trace_id: trace_id.map(str::to_owned),
            message_id: Uuid::new_v4().to_string(),
            message_type: message_type.to_owned(),
            sent_time: Utc::now(),
            message,
            reference: None,
        }
    }

    pub fn from_string(trace_id: Option<&str>, message_type: &str, message: &str) -> MessageEnvelope {
        MessageEnvelope::new(trace_id, message_type, message.as_bytes().to_vec())
    }

    /// Creates an envelope with the JSON serialization of `value` as payload.
    pub fn from_json<T: Serialize>(
        trace_id: Option<&str>,
        message_type: &str,
        value: &T,
    ) -> Result<MessageEnvelope, serde_json::Error> {
        Ok(MessageEnvelope::new(
            trace_id,
            message_type,
            serde_json::to_vec(value)?,
        ))
    }

    /// The payload as UTF-8, with invalid sequences replaced.
    pub fn get_message_as_string(&self) -> String {
        String::from_utf8_lossy(&self.message).into_owned()
    }

    pub fn set_message_as_string(&mut self, message: &str) {
        self.message = message.as_bytes().to_vec();
    }

    pub fn get_message_as_json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.message)
    }

    pub fn set_message_as_json<T: Serialize>(&mut self, value: &T) -> Result<(), serde_json::Error> {
        self.message = serde_json::to_vec(value)?;
        Ok(())
    }

    /// The pending delivery this envelope was received with, if not yet consumed.
    pub fn reference(&self) -> Option<&DeliveryToken> {
        self.reference.as_ref()
    }

    pub fn has_reference(&self) -> bool {
        self.reference.is_some()
    }

    pub(crate) fn set_reference(&mut self, token: DeliveryToken) {
        self.reference = Some(token);
    }

    pub(crate) fn take_reference(&mut self) -> Option<DeliveryToken> {
        self.reference.take()
    }
}

impl fmt::Display for MessageEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let payload = self.get_message_as_string();
        let preview: String = payload.chars().take(PREVIEW_LENGTH).collect();
        let ellipsis = if payload.chars().count() > PREVIEW_LENGTH {
            "..."
        } else {
            ""
        };

        write!(
            f,
            "[{},{},{}{}]",
            if self.message_id.is_empty() {
                "---"
            } else {
                self.message_id.as_str()
            },
            if self.message_type.is_empty() {
                "---"
            } else {
                self.message_type.as_str()
            },
            preview,
            ellipsis
        )
    }
}
