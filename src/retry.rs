//! Consumer-side retry and recovery.
//!
//! Wraps each handler invocation: on success the delivery is acked, on a
//! retryable failure the message is re-attempted (with backoff) until the
//! configured attempt budget is spent, and on exhaustion, or on a fatal
//! failure, the recovery strategy fires exactly once.
//!
//! Retries happen in place: the message stays in flight on its consumer,
//! counted against prefetch, and the attempt counter increments per
//! handler invocation. Retry bounds attempts, not wall-clock time; a
//! stuck handler is only cut short when a per-attempt timeout is
//! explicitly configured.

use std::time::Duration;

use tracing::{debug, error, warn};

use crate::config::{RecoveryStrategyKind, RetryConfig};
use crate::dispatcher::ConsumerHandler;
use crate::error::BrokerError;
use crate::message::{
    HEADER_EXCEPTION_MESSAGE, HEADER_ORIGINAL_QUEUE, HEADER_ORIGINAL_ROUTING_KEY,
};
use crate::router::{PublishStatus, Router};
use crate::store::{Delivery, QueueStore};

/// What a consumer handler reports back for a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// The message was processed; ack it.
    Success,
    /// Processing failed but may succeed on a later attempt. The reason
    /// is recorded in the trace headers if recovery ends up republishing.
    RetryableFailure(String),
    /// Processing failed permanently; skip remaining attempts and go
    /// straight to recovery.
    FatalFailure(String),
}

/// Resolved recovery strategy. Exactly one is active per deployment.
#[derive(Debug, Clone)]
pub enum RecoveryStrategy {
    /// Discard the message and report a terminal failure.
    RejectAndDrop,
    /// Return the message to the tail of its original queue with the
    /// attempt counter reset to 0.
    ///
    /// Known hazard: a deterministic failure makes this loop forever.
    /// That is the documented behavior of the strategy; no implicit cap
    /// is applied.
    ImmediateRequeue,
    /// Re-publish the message to the given exchange and routing key,
    /// with trace headers recording where and why it failed.
    RepublishToExchange {
        exchange: String,
        routing_key: String,
    },
}

/// The retry policy applied to every delivery a dispatcher processes.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    enabled: bool,
    max_attempts: u32,
    initial_interval: Duration,
    multiplier: f64,
    max_interval: Duration,
    attempt_timeout: Option<Duration>,
    recovery: RecoveryStrategy,
}

impl RetryPolicy {
    /// Builds a policy from configuration. Fails when the republish
    /// strategy is selected without a republish target.
    pub fn new(config: &RetryConfig) -> Result<Self, BrokerError> {
        let recovery = match config.recovery_strategy {
            RecoveryStrategyKind::Reject => RecoveryStrategy::RejectAndDrop,
            RecoveryStrategyKind::Requeue => RecoveryStrategy::ImmediateRequeue,
            RecoveryStrategyKind::Republish => match &config.republish {
                Some(target) => RecoveryStrategy::RepublishToExchange {
                    exchange: target.exchange.clone(),
                    routing_key: target.routing_key.clone(),
                },
                None => {
                    return Err(BrokerError::Config(
                        "recovery_strategy is 'republish' but no republish target is set"
                            .to_string(),
                    ))
                }
            },
        };
        Ok(Self {
            enabled: config.enabled,
            max_attempts: config.max_attempts,
            initial_interval: Duration::from_millis(config.initial_interval_ms),
            multiplier: config.multiplier,
            max_interval: Duration::from_millis(config.max_interval_ms),
            attempt_timeout: match config.attempt_timeout_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
            recovery,
        })
    }

    pub fn recovery(&self) -> &RecoveryStrategy {
        &self.recovery
    }

    /// Total delivery attempts a message gets. With retry disabled every
    /// message gets exactly one.
    fn effective_max_attempts(&self) -> u32 {
        if self.enabled {
            self.max_attempts.max(1)
        } else {
            1
        }
    }

    /// Backoff before the redelivery following the given attempt:
    /// `initial * multiplier^(attempt-1)`, clamped to the max interval.
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(0.0).powi(attempt.saturating_sub(1) as i32);
        let backoff = self.initial_interval.mul_f64(factor);
        backoff.min(self.max_interval)
    }
}

/// Runs one delivery through the handler under the retry policy and
/// settles it. Never returns an error: per-message failures are the
/// policy's business and must not take down the consumer loop.
pub(crate) async fn process_delivery(
    policy: &RetryPolicy,
    router: &Router,
    store: &QueueStore,
    handler: &dyn ConsumerHandler,
    mut delivery: Delivery,
) {
    let max_attempts = policy.effective_max_attempts();

    loop {
        let outcome = match policy.attempt_timeout {
            None => handler.handle(&delivery).await,
            Some(limit) => match tokio::time::timeout(limit, handler.handle(&delivery)).await {
                Ok(outcome) => outcome,
                Err(_) => HandlerOutcome::RetryableFailure(format!(
                    "attempt exceeded the {}ms timeout",
                    limit.as_millis()
                )),
            },
        };

        match outcome {
            HandlerOutcome::Success => {
                store.ack(delivery.delivery_tag).await;
                debug!(
                    queue = %delivery.queue,
                    message_id = %delivery.message.id,
                    attempt = delivery.message.delivery_attempt,
                    "message processed"
                );
                return;
            }
            HandlerOutcome::RetryableFailure(reason)
                if delivery.message.delivery_attempt < max_attempts =>
            {
                let backoff = policy.backoff(delivery.message.delivery_attempt);
                warn!(
                    queue = %delivery.queue,
                    message_id = %delivery.message.id,
                    attempt = delivery.message.delivery_attempt,
                    max_attempts,
                    reason = %reason,
                    "handler failed, message will be redelivered"
                );
                if !backoff.is_zero() {
                    tokio::time::sleep(backoff).await;
                }
                delivery.message.delivery_attempt += 1;
                store.bump_attempt(delivery.delivery_tag).await;
                delivery.redelivered = true;
            }
            HandlerOutcome::RetryableFailure(reason) | HandlerOutcome::FatalFailure(reason) => {
                recover(policy, router, store, &delivery, &reason).await;
                return;
            }
        }
    }
}

/// Applies the configured recovery strategy to a delivery whose attempts
/// are spent. Fires exactly once per message: every path first removes
/// the message from its in-flight slot.
async fn recover(
    policy: &RetryPolicy,
    router: &Router,
    store: &QueueStore,
    delivery: &Delivery,
    reason: &str,
) {
    match policy.recovery() {
        RecoveryStrategy::RejectAndDrop => {
            if store.take(delivery.delivery_tag).await.is_some() {
                error!(
                    queue = %delivery.queue,
                    message_id = %delivery.message.id,
                    attempts = delivery.message.delivery_attempt,
                    reason,
                    "retries exhausted, message rejected and dropped"
                );
            }
        }
        RecoveryStrategy::ImmediateRequeue => {
            if store.requeue_reset(delivery.delivery_tag).await {
                warn!(
                    queue = %delivery.queue,
                    message_id = %delivery.message.id,
                    attempts = delivery.message.delivery_attempt,
                    reason,
                    "retries exhausted, message requeued with attempt counter reset"
                );
            }
        }
        RecoveryStrategy::RepublishToExchange {
            exchange,
            routing_key,
        } => {
            let Some(mut message) = store.take(delivery.delivery_tag).await else {
                return;
            };
            message.headers.insert(
                HEADER_ORIGINAL_QUEUE.to_string(),
                delivery.queue.clone().into(),
            );
            message.headers.insert(
                HEADER_ORIGINAL_ROUTING_KEY.to_string(),
                message.routing_key.clone().into(),
            );
            message
                .headers
                .insert(HEADER_EXCEPTION_MESSAGE.to_string(), reason.into());
            message.routing_key = routing_key.clone();
            message.delivery_attempt = 0;
            let message_id = message.id.clone();

            match router.publish(exchange, message).await {
                Ok(PublishStatus::Routed(_)) => error!(
                    queue = %delivery.queue,
                    message_id = %message_id,
                    attempts = delivery.message.delivery_attempt,
                    target_exchange = %exchange,
                    target_routing_key = %routing_key,
                    reason,
                    "retries exhausted, message republished"
                ),
                Ok(status) => error!(
                    queue = %delivery.queue,
                    message_id = %message_id,
                    target_exchange = %exchange,
                    ?status,
                    "retries exhausted and republish reached no queue, message lost"
                ),
                Err(err) => error!(
                    queue = %delivery.queue,
                    message_id = %message_id,
                    target_exchange = %exchange,
                    error = %err,
                    "retries exhausted and republish failed, message lost"
                ),
            }
        }
    }
}
