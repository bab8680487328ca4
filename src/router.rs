//! Exchange routing with binding-based fan-out.
//!
//! The router owns the binding table and the queue stores. Publishing
//! resolves the set of matching queues for the message's routing key
//! according to the exchange kind, then enqueues an independent copy into
//! each matched queue.
//!
//! Declaration operations (exchanges, queues, bindings) are idempotent
//! for identical redeclaration and fail on conflicts. They take the write
//! lock, so a concurrent routing lookup sees either none or all of a
//! declaration, never a partially-applied one. Routing itself only ever
//! takes the read lock.
//!
//! The unnamed default exchange (`""`) is built in: it routes a message
//! directly to the queue whose name equals the routing key, and accepts
//! no bindings.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{QueueConfig, Topology};
use crate::confirm::{ConfirmTracker, ExpirationNotice};
use crate::error::BrokerError;
use crate::exchange::{topic_pattern_matches, ExchangeKind};
use crate::store::QueueStore;

/// An exchange-to-queue binding. Unique per (exchange, queue, pattern).
#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    queue: String,
    pattern: String,
}

struct RouterInner {
    exchanges: HashMap<String, ExchangeKind>,
    bindings: HashMap<String, Vec<Binding>>,
    queues: HashMap<String, Arc<QueueStore>>,
}

/// Result of publishing a message to an exchange.
#[derive(Debug, PartialEq, Eq)]
pub enum PublishStatus {
    /// Message enqueued into `count` queues.
    Routed(usize),
    /// No binding matched the routing key. Whether this becomes a
    /// `Returned` outcome or a silent drop is the publisher's decision.
    Unroutable,
    /// The named queue rejected the message because it is at capacity.
    Full(String),
}

/// Shared router type passed between components.
pub type SharedRouter = Arc<Router>;

/// The message router: binding table plus queue stores.
pub struct Router {
    inner: RwLock<RouterInner>,
}

impl Router {
    /// Creates an empty router with no exchanges, queues, or bindings.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RouterInner {
                exchanges: HashMap::new(),
                bindings: HashMap::new(),
                queues: HashMap::new(),
            }),
        }
    }

    /// Declares everything in the given topology, in order: exchanges,
    /// queues, bindings. The first conflict or unresolved reference
    /// aborts; declaration errors are fatal to startup.
    pub fn apply_topology(&self, topology: &Topology) -> Result<(), BrokerError> {
        for exchange in &topology.exchanges {
            self.declare_exchange(&exchange.name, exchange.kind)?;
        }
        for queue in &topology.queues {
            self.declare_queue(queue)?;
        }
        for binding in &topology.bindings {
            self.bind(&binding.exchange, &binding.queue, &binding.pattern)?;
        }
        info!(
            exchanges = topology.exchanges.len(),
            queues = topology.queues.len(),
            bindings = topology.bindings.len(),
            "topology applied"
        );
        Ok(())
    }

    /// Declares an exchange. Redeclaring with the same kind is a no-op;
    /// redeclaring with a different kind fails.
    pub fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError> {
        if name.is_empty() {
            // The built-in default exchange behaves as a direct exchange.
            return if kind == ExchangeKind::Direct {
                Ok(())
            } else {
                Err(BrokerError::KindConflict {
                    name: String::new(),
                    existing: ExchangeKind::Direct,
                    requested: kind,
                })
            };
        }
        let mut inner = self.write();
        match inner.exchanges.get(name) {
            Some(&existing) if existing == kind => {
                debug!(exchange = name, kind = %kind, "exchange already declared");
                Ok(())
            }
            Some(&existing) => Err(BrokerError::KindConflict {
                name: name.to_string(),
                existing,
                requested: kind,
            }),
            None => {
                inner.exchanges.insert(name.to_string(), kind);
                debug!(exchange = name, kind = %kind, "exchange declared");
                Ok(())
            }
        }
    }

    /// Declares a queue. Redeclaring with identical settings is a no-op;
    /// redeclaring with different settings fails.
    pub fn declare_queue(&self, config: &QueueConfig) -> Result<(), BrokerError> {
        let mut inner = self.write();
        match inner.queues.get(&config.name) {
            Some(store) if store.config() == config => {
                debug!(queue = %config.name, "queue already declared");
                Ok(())
            }
            Some(_) => Err(BrokerError::QueueConflict(config.name.clone())),
            None => {
                inner
                    .queues
                    .insert(config.name.clone(), Arc::new(QueueStore::new(config.clone())));
                debug!(queue = %config.name, durable = config.durable, "queue declared");
                Ok(())
            }
        }
    }

    /// Binds a queue to an exchange with a routing pattern. Both must
    /// already exist. Redeclaring an identical binding is a no-op.
    pub fn bind(&self, exchange: &str, queue: &str, pattern: &str) -> Result<(), BrokerError> {
        if exchange.is_empty() {
            // The default exchange accepts no bindings.
            return Err(BrokerError::ExchangeNotFound(String::new()));
        }
        let mut inner = self.write();
        if !inner.exchanges.contains_key(exchange) {
            return Err(BrokerError::ExchangeNotFound(exchange.to_string()));
        }
        if !inner.queues.contains_key(queue) {
            return Err(BrokerError::QueueNotFound(queue.to_string()));
        }
        let binding = Binding {
            queue: queue.to_string(),
            pattern: pattern.to_string(),
        };
        let bindings = inner.bindings.entry(exchange.to_string()).or_default();
        if bindings.contains(&binding) {
            debug!(exchange, queue, pattern, "binding already declared");
            return Ok(());
        }
        bindings.push(binding);
        debug!(exchange, queue, pattern, "binding declared");
        Ok(())
    }

    /// Computes the set of queues a routing key resolves to on the given
    /// exchange. The result contains each queue at most once, even when
    /// several of its bindings match.
    pub fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, BrokerError> {
        let inner = self.read();
        resolve_routes(&inner, exchange, routing_key)
    }

    /// Publishes a message to an exchange, fanning out one copy per
    /// matched queue. Copies have independent lifecycles from here on.
    ///
    /// An unknown exchange is an error; a known exchange with no matching
    /// binding is the `Unroutable` status, which the publisher turns into
    /// a `Returned` outcome or a silent drop depending on the publish
    /// options.
    pub async fn publish(
        &self,
        exchange: &str,
        message: crate::message::Message,
    ) -> Result<PublishStatus, BrokerError> {
        let targets: Vec<(String, Arc<QueueStore>)> = {
            let inner = self.read();
            let routes = resolve_routes(&inner, exchange, &message.routing_key)?;
            routes
                .into_iter()
                .filter_map(|name| inner.queues.get(&name).map(|s| (name, s.clone())))
                .collect()
        };

        if targets.is_empty() {
            debug!(
                exchange,
                routing_key = %message.routing_key,
                "no binding matched"
            );
            return Ok(PublishStatus::Unroutable);
        }

        let count = targets.len();
        for (queue, store) in targets {
            if !store.enqueue(message.clone()).await {
                warn!(queue = %queue, "enqueue rejected, queue at capacity");
                return Ok(PublishStatus::Full(queue));
            }
        }
        Ok(PublishStatus::Routed(count))
    }

    /// Returns the store for the given queue, if declared.
    pub fn get_store(&self, queue: &str) -> Option<Arc<QueueStore>> {
        self.read().queues.get(queue).cloned()
    }

    /// Returns the names of all declared queues.
    pub fn queue_names(&self) -> Vec<String> {
        self.read().queues.keys().cloned().collect()
    }

    /// Returns true if the exchange has been declared. The default
    /// exchange always exists.
    pub fn has_exchange(&self, name: &str) -> bool {
        name.is_empty() || self.read().exchanges.contains_key(name)
    }

    /// Drains expired messages from every queue and re-routes each one
    /// through its queue's dead-letter exchange, exactly once. Queues
    /// without a dead-letter target just drop their expired messages.
    /// Returns one notice per expired message for observability.
    pub async fn sweep_expired(&self) -> Vec<ExpirationNotice> {
        let stores: Vec<Arc<QueueStore>> = {
            let inner = self.read();
            inner.queues.values().cloned().collect()
        };

        let mut notices = Vec::new();
        for store in stores {
            let expired = store.take_expired().await;
            for envelope in expired {
                let config = store.config();
                let message_id = envelope.message.id.clone();
                let mut dead_lettered = false;
                if let Some(dlx) = &config.dead_letter_exchange {
                    let mut message = envelope.message;
                    let routing_key = config
                        .dead_letter_routing_key
                        .clone()
                        .unwrap_or_else(|| message.routing_key.clone());
                    message.routing_key = routing_key;
                    // Clear the TTL so the message does not expire again
                    // while parked on the dead-letter queue.
                    message.expiration_ms = None;
                    match self.publish(dlx, message).await {
                        Ok(PublishStatus::Routed(_)) => dead_lettered = true,
                        Ok(status) => warn!(
                            queue = %config.name,
                            dead_letter_exchange = %dlx,
                            ?status,
                            "dead-letter publish did not reach any queue"
                        ),
                        Err(err) => warn!(
                            queue = %config.name,
                            dead_letter_exchange = %dlx,
                            error = %err,
                            "dead-letter publish failed"
                        ),
                    }
                }
                notices.push(ExpirationNotice {
                    message_id,
                    queue: config.name.clone(),
                    dead_lettered,
                });
            }
        }
        notices
    }

    fn read(&self) -> RwLockReadGuard<'_, RouterInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, RouterInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

fn resolve_routes(
    inner: &RouterInner,
    exchange: &str,
    routing_key: &str,
) -> Result<Vec<String>, BrokerError> {
    if exchange.is_empty() {
        // Default exchange: route straight to the queue named by the key.
        return Ok(if inner.queues.contains_key(routing_key) {
            vec![routing_key.to_string()]
        } else {
            Vec::new()
        });
    }

    let kind = *inner
        .exchanges
        .get(exchange)
        .ok_or_else(|| BrokerError::ExchangeNotFound(exchange.to_string()))?;
    let bindings = inner
        .bindings
        .get(exchange)
        .map(Vec::as_slice)
        .unwrap_or(&[]);

    let mut seen = HashSet::new();
    let mut matched = Vec::new();
    for binding in bindings {
        let hit = match kind {
            ExchangeKind::Fanout => true,
            ExchangeKind::Direct => binding.pattern == routing_key,
            ExchangeKind::Topic => topic_pattern_matches(&binding.pattern, routing_key),
        };
        if hit && seen.insert(binding.queue.clone()) {
            matched.push(binding.queue.clone());
        }
    }
    Ok(matched)
}

/// Spawns a background task that periodically sweeps expired messages and
/// forwards each expiration notice to the tracker. The task runs until
/// aborted via the returned handle.
pub fn spawn_expiry_sweeper(
    router: SharedRouter,
    tracker: Arc<ConfirmTracker>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            for notice in router.sweep_expired().await {
                tracker.notify_expired(notice);
            }
        }
    })
}
