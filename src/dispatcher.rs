//! Handler registration and message dispatch.
//!
//! The dispatcher is an explicit registration table from queue name to
//! handler, built at startup. `start` attaches one consumer per
//! registration (or several, for queues worked by competing consumers)
//! and spawns a task per consumer that pulls deliveries and runs them
//! through the retry policy.
//!
//! Handler failures are absorbed per message; a failing handler never
//! takes down its consumer task or any other consumer.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::RetryConfig;
use crate::error::BrokerError;
use crate::retry::{self, HandlerOutcome, RetryPolicy};
use crate::router::SharedRouter;
use crate::store::{ConsumerHandle, Delivery, QueueStore};

/// Application-facing consumer contract: one handler per queue,
/// invoked per delivery. The returned outcome drives the retry and
/// recovery machinery.
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery) -> HandlerOutcome;
}

struct Registration {
    queue: String,
    handler: Arc<dyn ConsumerHandler>,
    consumers: usize,
}

/// Builds and runs the consumer side of the engine.
pub struct Dispatcher {
    router: SharedRouter,
    policy: Arc<RetryPolicy>,
    registrations: Vec<Registration>,
}

impl Dispatcher {
    /// Creates a dispatcher using the given retry configuration for all
    /// registered handlers.
    pub fn new(router: SharedRouter, retry: &RetryConfig) -> Result<Self, BrokerError> {
        Ok(Self {
            router,
            policy: Arc::new(RetryPolicy::new(retry)?),
            registrations: Vec::new(),
        })
    }

    /// Registers a handler for a queue with a single consumer.
    pub fn register(self, queue: &str, handler: Arc<dyn ConsumerHandler>) -> Self {
        self.register_consumers(queue, handler, 1)
    }

    /// Registers a handler for a queue with `consumers` competing
    /// consumers. The same queue may be registered several times, each
    /// registration contributing its own consumers.
    pub fn register_consumers(
        mut self,
        queue: &str,
        handler: Arc<dyn ConsumerHandler>,
        consumers: usize,
    ) -> Self {
        self.registrations.push(Registration {
            queue: queue.to_string(),
            handler,
            consumers: consumers.max(1),
        });
        self
    }

    /// Attaches all consumers and starts their delivery loops.
    ///
    /// Every registered queue must already be declared; an unknown queue
    /// is a fatal startup error and nothing is started.
    pub async fn start(self) -> Result<DispatcherHandle, BrokerError> {
        // Resolve every store up front so a bad registration aborts
        // before any consumer attaches.
        let mut resolved = Vec::with_capacity(self.registrations.len());
        for registration in &self.registrations {
            let store = self
                .router
                .get_store(&registration.queue)
                .ok_or_else(|| BrokerError::QueueNotFound(registration.queue.clone()))?;
            resolved.push(store);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();
        for (registration, store) in self.registrations.iter().zip(resolved) {
            for _ in 0..registration.consumers {
                let handle = store.attach_consumer(store.config().prefetch).await;
                tasks.push(tokio::spawn(consumer_loop(
                    self.router.clone(),
                    store.clone(),
                    self.policy.clone(),
                    registration.handler.clone(),
                    handle,
                    shutdown_rx.clone(),
                )));
            }
            debug!(
                queue = %registration.queue,
                consumers = registration.consumers,
                "handler registered and consuming"
            );
        }
        info!(consumers = tasks.len(), "dispatcher started");

        Ok(DispatcherHandle {
            shutdown: shutdown_tx,
            tasks,
        })
    }
}

/// Running dispatcher. Dropping the handle also shuts the consumers
/// down; prefer calling [`shutdown`](Self::shutdown) to wait for them.
pub struct DispatcherHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl DispatcherHandle {
    /// Signals all consumer loops to stop and waits for them to detach.
    /// In-flight messages of detaching consumers return to the head of
    /// their queues.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        join_all(self.tasks).await;
        info!("dispatcher stopped");
    }
}

async fn consumer_loop(
    router: SharedRouter,
    store: Arc<QueueStore>,
    policy: Arc<RetryPolicy>,
    handler: Arc<dyn ConsumerHandler>,
    handle: ConsumerHandle,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            delivery = store.next_delivery(handle) => {
                match delivery {
                    None => break,
                    Some(delivery) => {
                        retry::process_delivery(
                            &policy,
                            &router,
                            &store,
                            handler.as_ref(),
                            delivery,
                        )
                        .await;
                    }
                }
            }
        }
    }
    store.detach_consumer(handle).await;
}
