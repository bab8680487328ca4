//! Producer-side delivery acknowledgment tracking.
//!
//! Every tracked publish registers a correlation token and gets back a
//! [`PublishHandle`] carrying two independent signal channels:
//!
//! - **confirm**: the broker accepted the message (ack) or rejected it
//!   (nack, e.g. a queue at capacity). Fires exactly once per token.
//! - **return**: the broker accepted the message but no queue matched the
//!   routing key. Fires zero or one time, before the confirm.
//!
//! Confirm and return are not an either/or pair. A publish can be
//! confirmed *and* returned: the broker got the message, routing failed.
//! Callers must never treat an ack as proof of delivery to a queue.
//!
//! The tracker also carries expiration notices: a message whose TTL
//! elapses while enqueued is a normal lifecycle transition, not an
//! error, but it has to be observable.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::message::Message;

/// AMQP reply code for a mandatory message that matched no binding.
pub const REPLY_CODE_NO_ROUTE: u16 = 312;
/// Reply text accompanying [`REPLY_CODE_NO_ROUTE`].
pub const REPLY_TEXT_NO_ROUTE: &str = "NO_ROUTE";

/// Broker acceptance signal for a tracked publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirm {
    /// The broker accepted the message.
    Ack,
    /// The broker rejected the message; the reason says why.
    Nack(String),
}

impl Confirm {
    pub fn is_ack(&self) -> bool {
        matches!(self, Confirm::Ack)
    }
}

/// A message handed back to the producer because routing failed.
#[derive(Debug, Clone)]
pub struct ReturnedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub reply_code: u16,
    pub reply_text: String,
    pub message: Message,
}

/// Notice that a message expired in a queue before being consumed.
#[derive(Debug, Clone)]
pub struct ExpirationNotice {
    pub message_id: String,
    pub queue: String,
    /// True when the message was re-routed to a dead-letter exchange.
    pub dead_lettered: bool,
}

struct PendingPublish {
    confirm_tx: oneshot::Sender<Confirm>,
    return_tx: Option<oneshot::Sender<ReturnedMessage>>,
}

/// Tracks confirm/return signals for outstanding publishes, keyed by
/// correlation token.
pub struct ConfirmTracker {
    pending: Mutex<HashMap<String, PendingPublish>>,
    expiry_tx: Mutex<Option<mpsc::UnboundedSender<ExpirationNotice>>>,
}

impl ConfirmTracker {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            expiry_tx: Mutex::new(None),
        }
    }

    /// Registers a publish under the given correlation token and returns
    /// the handle its signals are delivered on. Registering the same
    /// token twice replaces the earlier registration.
    pub fn register(&self, token: impl Into<String>) -> PublishHandle {
        let token = token.into();
        let (confirm_tx, confirm_rx) = oneshot::channel();
        let (return_tx, return_rx) = oneshot::channel();
        let previous = self.lock_pending().insert(
            token.clone(),
            PendingPublish {
                confirm_tx,
                return_tx: Some(return_tx),
            },
        );
        if previous.is_some() {
            warn!(token = %token, "correlation token re-registered, dropping earlier handle");
        }
        PublishHandle {
            token,
            confirm_rx,
            return_rx,
        }
    }

    /// Fires the confirm signal for a token. At most one confirm is
    /// delivered per registration; later calls for the same token are
    /// ignored.
    pub fn confirm(&self, token: &str, confirm: Confirm) {
        match self.lock_pending().remove(token) {
            None => debug!(token, "confirm for unknown or already-settled token"),
            Some(pending) => {
                // Dropping the entry also drops any unfired return sender,
                // which resolves the handle's return channel as "none".
                let _ = pending.confirm_tx.send(confirm);
            }
        }
    }

    /// Records a returned message for a token. Fires at most once and
    /// independently of the confirm signal.
    pub fn record_return(&self, token: &str, returned: ReturnedMessage) {
        match self.lock_pending().get_mut(token) {
            None => debug!(token, "return for unknown or already-settled token"),
            Some(pending) => match pending.return_tx.take() {
                None => debug!(token, "duplicate return suppressed"),
                Some(tx) => {
                    let _ = tx.send(returned);
                }
            },
        }
    }

    /// Drops a registration without firing any signal, e.g. when the
    /// publish itself failed before reaching a queue.
    pub fn forget(&self, token: &str) {
        self.lock_pending().remove(token);
    }

    /// Returns the receiver for expiration notices. Calling this again
    /// replaces the previous subscription.
    pub fn expirations(&self) -> mpsc::UnboundedReceiver<ExpirationNotice> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self
            .expiry_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(tx);
        rx
    }

    /// Delivers an expiration notice to the subscriber, if any.
    pub fn notify_expired(&self, notice: ExpirationNotice) {
        let mut guard = self.expiry_tx.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = guard.as_ref() {
            if tx.send(notice).is_err() {
                // Subscriber went away; stop holding the channel.
                *guard = None;
            }
        }
    }

    /// Number of publishes still awaiting their confirm.
    pub fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingPublish>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ConfirmTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Awaitable completion handle for a single tracked publish.
///
/// The confirm and return signals are independent events: await the
/// confirm, then check [`take_return`](Self::take_return) for a routing
/// failure. The return signal, when there is one, is always recorded
/// before the confirm fires.
pub struct PublishHandle {
    token: String,
    confirm_rx: oneshot::Receiver<Confirm>,
    return_rx: oneshot::Receiver<ReturnedMessage>,
}

impl PublishHandle {
    /// The correlation token this handle is registered under.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Waits for the broker's confirm. Resolves once; if the tracker is
    /// dropped without confirming, this reports a nack.
    pub async fn confirmed(&mut self) -> Confirm {
        match (&mut self.confirm_rx).await {
            Ok(confirm) => confirm,
            Err(_) => Confirm::Nack("confirm channel closed".to_string()),
        }
    }

    /// Waits for the return signal. Resolves `None` as soon as it is
    /// known that no return will fire (the publish was settled without
    /// one).
    pub async fn returned(&mut self) -> Option<ReturnedMessage> {
        (&mut self.return_rx).await.ok()
    }

    /// Non-blocking check for a recorded return.
    pub fn take_return(&mut self) -> Option<ReturnedMessage> {
        self.return_rx.try_recv().ok()
    }
}
