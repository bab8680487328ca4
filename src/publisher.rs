//! Producer facade: publishing with confirm and return tracking.
//!
//! The publisher owns nothing global; it is handed the router and the
//! confirm tracker once, at construction, and every publish flows through
//! those references.
//!
//! The unroutable policy is explicit per publish: a `mandatory` publish
//! that matches no binding produces a `Returned` outcome on the publish
//! handle, a non-mandatory one is silently dropped. Either way the
//! confirm still fires with an ack, because the broker did accept the
//! message; an ack is not proof of delivery to any queue.

use std::sync::Arc;

use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::confirm::{
    Confirm, ConfirmTracker, PublishHandle, ReturnedMessage, REPLY_CODE_NO_ROUTE,
    REPLY_TEXT_NO_ROUTE,
};
use crate::error::BrokerError;
use crate::message::Message;
use crate::router::{PublishStatus, SharedRouter};

/// Per-publish options.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// When true, a publish that matches no binding is handed back as a
    /// `Returned` outcome instead of being silently dropped.
    pub mandatory: bool,
    /// Correlation token for the confirm/return signals. Generated
    /// (UUID v4) when not supplied.
    pub correlation_token: Option<String>,
    /// Overrides the message's TTL for this publish.
    pub expiration_ms: Option<u64>,
}

impl PublishOptions {
    pub fn mandatory() -> Self {
        PublishOptions {
            mandatory: true,
            ..PublishOptions::default()
        }
    }
}

/// The producer-side entry point of the engine.
pub struct Publisher {
    router: SharedRouter,
    tracker: Arc<ConfirmTracker>,
}

impl Publisher {
    pub fn new(router: SharedRouter, tracker: Arc<ConfirmTracker>) -> Self {
        Self { router, tracker }
    }

    /// Fire-and-forget publish of a raw payload. Unroutable messages are
    /// dropped silently; use [`publish`](Self::publish) with mandatory
    /// options to observe routing failures.
    pub async fn send(
        &self,
        exchange: &str,
        routing_key: &str,
        body: impl Into<Vec<u8>>,
    ) -> Result<(), BrokerError> {
        let message = Message::builder()
            .routing_key(routing_key)
            .body(body)
            .build();
        self.publish(exchange, message, PublishOptions::default())
            .await
            .map(|_| ())
    }

    /// Fire-and-forget publish of a JSON payload with a generated
    /// message id.
    pub async fn send_json<T: Serialize>(
        &self,
        exchange: &str,
        routing_key: &str,
        value: &T,
    ) -> Result<(), BrokerError> {
        let message = Message::json(routing_key, value)?;
        self.publish(exchange, message, PublishOptions::default())
            .await
            .map(|_| ())
    }

    /// Publishes a message and returns the handle its confirm and return
    /// signals are delivered on.
    ///
    /// An unknown exchange is an error; everything else settles through
    /// the handle: ack once the message is enqueued (or accepted but
    /// unroutable), nack when a matched queue rejected it at capacity,
    /// plus an independent return signal for mandatory unroutable
    /// publishes.
    pub async fn publish(
        &self,
        exchange: &str,
        mut message: Message,
        options: PublishOptions,
    ) -> Result<PublishHandle, BrokerError> {
        if let Some(ttl) = options.expiration_ms {
            message.expiration_ms = Some(ttl);
        }
        let token = options
            .correlation_token
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let handle = self.tracker.register(&token);

        // Keep a copy around only when a return might need to carry it back.
        let return_copy = options.mandatory.then(|| message.clone());
        let routing_key = message.routing_key.clone();

        let status = match self.router.publish(exchange, message).await {
            Ok(status) => status,
            Err(err) => {
                self.tracker.forget(&token);
                return Err(err);
            }
        };

        match status {
            PublishStatus::Routed(count) => {
                debug!(exchange, routing_key = %routing_key, count, token = %token, "publish routed");
                self.tracker.confirm(&token, Confirm::Ack);
            }
            PublishStatus::Unroutable => {
                if let Some(message) = return_copy {
                    debug!(exchange, routing_key = %routing_key, token = %token, "publish returned, no route");
                    self.tracker.record_return(
                        &token,
                        ReturnedMessage {
                            exchange: exchange.to_string(),
                            routing_key,
                            reply_code: REPLY_CODE_NO_ROUTE,
                            reply_text: REPLY_TEXT_NO_ROUTE.to_string(),
                            message,
                        },
                    );
                } else {
                    debug!(exchange, routing_key = %routing_key, token = %token, "publish unroutable, dropped");
                }
                // The broker accepted the message even though routing
                // failed; confirm and return are independent signals.
                self.tracker.confirm(&token, Confirm::Ack);
            }
            PublishStatus::Full(queue) => {
                self.tracker.confirm(
                    &token,
                    Confirm::Nack(format!("queue '{queue}' is at capacity")),
                );
            }
        }
        Ok(handle)
    }
}
