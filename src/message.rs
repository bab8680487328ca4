//! The message entity exchanged between producers, queues, and consumers.
//!
//! A `Message` carries an opaque payload plus the routing metadata the
//! engine needs: routing key, headers, optional TTL, and the delivery
//! attempt counter maintained by the queue stores.

use std::collections::HashMap;

use serde::Serialize;
use uuid::Uuid;

/// Header added when a recovery republish records the queue the message
/// originally failed on.
pub const HEADER_ORIGINAL_QUEUE: &str = "x-original-queue";
/// Header added when a recovery republish records the message's original
/// routing key.
pub const HEADER_ORIGINAL_ROUTING_KEY: &str = "x-original-routing-key";
/// Header added when a recovery republish records the handler's failure
/// summary.
pub const HEADER_EXCEPTION_MESSAGE: &str = "x-exception-message";

/// Content type stamped on messages built with [`Message::json`].
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// A routable message.
#[derive(Debug, Clone)]
pub struct Message {
    /// Unique message id. Generated (UUID v4) when not supplied.
    pub id: String,
    /// Opaque payload bytes.
    pub body: Vec<u8>,
    /// Optional payload content type.
    pub content_type: Option<String>,
    /// Routing key used for binding matches.
    pub routing_key: String,
    /// Application headers.
    pub headers: HashMap<String, serde_json::Value>,
    /// Optional time-to-live. A message that sits unconsumed in a queue
    /// past this duration is expired and removed.
    pub expiration_ms: Option<u64>,
    /// Number of times this message has been handed to a consumer.
    /// Starts at 0 and only ever increases, except for the explicit
    /// requeue recovery strategy which resets it.
    pub delivery_attempt: u32,
}

impl Message {
    pub fn builder() -> MessageBuilder {
        MessageBuilder::default()
    }

    /// Builds a plain-text message with a generated id.
    pub fn text(routing_key: impl Into<String>, body: impl Into<String>) -> Message {
        Message::builder()
            .routing_key(routing_key)
            .body(body.into().into_bytes())
            .build()
    }

    /// Builds a JSON message from any serializable value, with a
    /// generated id and `application/json` content type.
    pub fn json<T: Serialize>(
        routing_key: impl Into<String>,
        value: &T,
    ) -> Result<Message, serde_json::Error> {
        Ok(Message::builder()
            .routing_key(routing_key)
            .body(serde_json::to_vec(value)?)
            .content_type(CONTENT_TYPE_JSON)
            .build())
    }
}

/// Builder for [`Message`].
#[derive(Debug, Default)]
pub struct MessageBuilder {
    id: Option<String>,
    body: Vec<u8>,
    content_type: Option<String>,
    routing_key: String,
    headers: HashMap<String, serde_json::Value>,
    expiration_ms: Option<u64>,
}

impl MessageBuilder {
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn routing_key(mut self, key: impl Into<String>) -> Self {
        self.routing_key = key.into();
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn expiration_ms(mut self, ttl_ms: u64) -> Self {
        self.expiration_ms = Some(ttl_ms);
        self
    }

    pub fn build(self) -> Message {
        Message {
            id: self.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            body: self.body,
            content_type: self.content_type,
            routing_key: self.routing_key,
            headers: self.headers,
            expiration_ms: self.expiration_ms,
            delivery_attempt: 0,
        }
    }
}
