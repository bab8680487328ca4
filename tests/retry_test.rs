use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fast_rabbitmq_emulator::config::{Config, RecoveryStrategyKind, RepublishTarget, RetryConfig};
use fast_rabbitmq_emulator::dispatcher::{ConsumerHandler, Dispatcher};
use fast_rabbitmq_emulator::message::{
    Message, HEADER_EXCEPTION_MESSAGE, HEADER_ORIGINAL_QUEUE, HEADER_ORIGINAL_ROUTING_KEY,
};
use fast_rabbitmq_emulator::retry::HandlerOutcome;
use fast_rabbitmq_emulator::router::Router;
use fast_rabbitmq_emulator::store::{Delivery, QueueStore};

/// Handler that fails (retryably) until `succeed_after` invocations have
/// happened, then succeeds.
struct FlakyHandler {
    invocations: Arc<AtomicUsize>,
    succeed_after: usize,
}

#[async_trait]
impl ConsumerHandler for FlakyHandler {
    async fn handle(&self, _delivery: &Delivery) -> HandlerOutcome {
        let n = self.invocations.fetch_add(1, Ordering::SeqCst) + 1;
        if n >= self.succeed_after {
            HandlerOutcome::Success
        } else {
            HandlerOutcome::RetryableFailure(format!("simulated failure on invocation {n}"))
        }
    }
}

/// Handler that always fails retryably.
struct AlwaysFailingHandler {
    invocations: Arc<AtomicUsize>,
}

#[async_trait]
impl ConsumerHandler for AlwaysFailingHandler {
    async fn handle(&self, _delivery: &Delivery) -> HandlerOutcome {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        HandlerOutcome::RetryableFailure("simulated failure".to_string())
    }
}

/// Handler that fails fatally on the first invocation.
struct FatalHandler {
    invocations: Arc<AtomicUsize>,
}

#[async_trait]
impl ConsumerHandler for FatalHandler {
    async fn handle(&self, _delivery: &Delivery) -> HandlerOutcome {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        HandlerOutcome::FatalFailure("unparseable payload".to_string())
    }
}

/// Handler that never finishes within any reasonable attempt timeout.
struct StuckHandler {
    invocations: Arc<AtomicUsize>,
}

#[async_trait]
impl ConsumerHandler for StuckHandler {
    async fn handle(&self, _delivery: &Delivery) -> HandlerOutcome {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(3600)).await;
        HandlerOutcome::Success
    }
}

/// Router with an input queue plus the error exchange/queue pair used by
/// the republish recovery strategy.
fn error_handling_router() -> Arc<Router> {
    let yaml = r#"
topology:
  exchanges:
    - name: "error.direct"
      kind: direct
  queues:
    - name: "input.queue"
      prefetch: 1
    - name: "error.queue"
      durable: true
  bindings:
    - exchange: "error.direct"
      queue: "error.queue"
      pattern: "error"
"#;
    let config = Config::from_yaml(yaml).unwrap();
    let router = Arc::new(Router::new());
    router.apply_topology(&config.topology).unwrap();
    router
}

fn retry_config(strategy: RecoveryStrategyKind) -> RetryConfig {
    RetryConfig {
        enabled: true,
        max_attempts: 3,
        // No backoff so the tests run fast.
        initial_interval_ms: 0,
        recovery_strategy: strategy,
        republish: match strategy {
            RecoveryStrategyKind::Republish => Some(RepublishTarget {
                exchange: "error.direct".to_string(),
                routing_key: "error".to_string(),
            }),
            _ => None,
        },
        ..RetryConfig::default()
    }
}

async fn wait_for_drain(store: &QueueStore, limit: Duration) {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if store.pending_count().await == 0 && store.in_flight_count().await == 0 {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "queue did not drain within {limit:?}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_failing_message_delivered_exactly_max_attempts() {
    let router = error_handling_router();
    let invocations = Arc::new(AtomicUsize::new(0));

    let dispatcher = Dispatcher::new(router.clone(), &retry_config(RecoveryStrategyKind::Reject))
        .unwrap()
        .register(
            "input.queue",
            Arc::new(AlwaysFailingHandler {
                invocations: invocations.clone(),
            }),
        );
    let handle = dispatcher.start().await.unwrap();

    router
        .publish("", Message::text("input.queue", "doomed"))
        .await
        .unwrap();

    let store = router.get_store("input.queue").unwrap();
    wait_for_drain(&store, Duration::from_secs(5)).await;
    handle.shutdown().await;

    assert_eq!(invocations.load(Ordering::SeqCst), 3);
    // Reject recovery dropped the message for good.
    assert_eq!(store.pending_count().await, 0);
}

#[tokio::test]
async fn test_retry_succeeds_before_exhaustion() {
    let router = error_handling_router();
    let invocations = Arc::new(AtomicUsize::new(0));

    let dispatcher = Dispatcher::new(router.clone(), &retry_config(RecoveryStrategyKind::Reject))
        .unwrap()
        .register(
            "input.queue",
            Arc::new(FlakyHandler {
                invocations: invocations.clone(),
                succeed_after: 2,
            }),
        );
    let handle = dispatcher.start().await.unwrap();

    router
        .publish("", Message::text("input.queue", "eventually-fine"))
        .await
        .unwrap();

    let store = router.get_store("input.queue").unwrap();
    wait_for_drain(&store, Duration::from_secs(5)).await;
    handle.shutdown().await;

    assert_eq!(invocations.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_republish_recovery_adds_trace_headers() {
    let router = error_handling_router();
    let invocations = Arc::new(AtomicUsize::new(0));

    let dispatcher = Dispatcher::new(
        router.clone(),
        &retry_config(RecoveryStrategyKind::Republish),
    )
    .unwrap()
    .register(
        "input.queue",
        Arc::new(AlwaysFailingHandler {
            invocations: invocations.clone(),
        }),
    );
    let handle = dispatcher.start().await.unwrap();

    router
        .publish("", Message::text("input.queue", "doomed"))
        .await
        .unwrap();

    let input = router.get_store("input.queue").unwrap();
    wait_for_drain(&input, Duration::from_secs(5)).await;

    let error_store = router.get_store("error.queue").unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while error_store.pending_count().await == 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "republished message never arrived"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    handle.shutdown().await;

    // The exhausted message appears exactly once on the error queue.
    assert_eq!(error_store.pending_count().await, 1);
    let consumer = error_store.attach_consumer(0).await;
    let delivery = error_store.try_next_delivery(consumer).await.unwrap();
    assert_eq!(String::from_utf8_lossy(&delivery.message.body), "doomed");
    assert_eq!(delivery.message.routing_key, "error");
    assert_eq!(
        delivery.message.headers[HEADER_ORIGINAL_QUEUE],
        "input.queue"
    );
    assert_eq!(
        delivery.message.headers[HEADER_ORIGINAL_ROUTING_KEY],
        "input.queue"
    );
    assert_eq!(
        delivery.message.headers[HEADER_EXCEPTION_MESSAGE],
        "simulated failure"
    );
}

#[tokio::test]
async fn test_requeue_recovery_resets_and_retries_again() {
    let router = error_handling_router();
    let invocations = Arc::new(AtomicUsize::new(0));

    // Fails through one full retry cycle (3 attempts), gets requeued with
    // the counter reset, then succeeds on the last attempt of the second
    // cycle. A deterministic failure would cycle forever; that is the
    // documented hazard of this strategy.
    let dispatcher = Dispatcher::new(router.clone(), &retry_config(RecoveryStrategyKind::Requeue))
        .unwrap()
        .register(
            "input.queue",
            Arc::new(FlakyHandler {
                invocations: invocations.clone(),
                succeed_after: 6,
            }),
        );
    let handle = dispatcher.start().await.unwrap();

    router
        .publish("", Message::text("input.queue", "stubborn"))
        .await
        .unwrap();

    let store = router.get_store("input.queue").unwrap();
    wait_for_drain(&store, Duration::from_secs(10)).await;
    handle.shutdown().await;

    assert_eq!(invocations.load(Ordering::SeqCst), 6);
}

#[tokio::test]
async fn test_fatal_failure_skips_remaining_attempts() {
    let router = error_handling_router();
    let invocations = Arc::new(AtomicUsize::new(0));

    let dispatcher = Dispatcher::new(router.clone(), &retry_config(RecoveryStrategyKind::Reject))
        .unwrap()
        .register(
            "input.queue",
            Arc::new(FatalHandler {
                invocations: invocations.clone(),
            }),
        );
    let handle = dispatcher.start().await.unwrap();

    router
        .publish("", Message::text("input.queue", "garbage"))
        .await
        .unwrap();

    let store = router.get_store("input.queue").unwrap();
    wait_for_drain(&store, Duration::from_secs(5)).await;
    handle.shutdown().await;

    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_retry_disabled_gives_single_attempt() {
    let router = error_handling_router();
    let invocations = Arc::new(AtomicUsize::new(0));

    let config = RetryConfig {
        enabled: false,
        ..retry_config(RecoveryStrategyKind::Reject)
    };
    let dispatcher = Dispatcher::new(router.clone(), &config)
        .unwrap()
        .register(
            "input.queue",
            Arc::new(AlwaysFailingHandler {
                invocations: invocations.clone(),
            }),
        );
    let handle = dispatcher.start().await.unwrap();

    router
        .publish("", Message::text("input.queue", "one-shot"))
        .await
        .unwrap();

    let store = router.get_store("input.queue").unwrap();
    wait_for_drain(&store, Duration::from_secs(5)).await;
    handle.shutdown().await;

    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_attempt_timeout_bounds_stuck_handler() {
    let router = error_handling_router();
    let invocations = Arc::new(AtomicUsize::new(0));

    let config = RetryConfig {
        max_attempts: 2,
        attempt_timeout_ms: 50,
        ..retry_config(RecoveryStrategyKind::Reject)
    };
    let dispatcher = Dispatcher::new(router.clone(), &config)
        .unwrap()
        .register(
            "input.queue",
            Arc::new(StuckHandler {
                invocations: invocations.clone(),
            }),
        );
    let handle = dispatcher.start().await.unwrap();

    router
        .publish("", Message::text("input.queue", "slow"))
        .await
        .unwrap();

    let store = router.get_store("input.queue").unwrap();
    wait_for_drain(&store, Duration::from_secs(5)).await;
    handle.shutdown().await;

    // Both attempts timed out, then the message was rejected.
    assert_eq!(invocations.load(Ordering::SeqCst), 2);
    assert_eq!(store.pending_count().await, 0);
}
