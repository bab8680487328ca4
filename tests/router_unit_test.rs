use fast_rabbitmq_emulator::config::{Config, QueueConfig};
use fast_rabbitmq_emulator::error::BrokerError;
use fast_rabbitmq_emulator::exchange::ExchangeKind;
use fast_rabbitmq_emulator::message::Message;
use fast_rabbitmq_emulator::router::{PublishStatus, Router};

fn test_router() -> Router {
    let yaml = r##"
topology:
  exchanges:
    - name: "orders.direct"
      kind: direct
    - name: "orders.fanout"
      kind: fanout
    - name: "orders.topic"
      kind: topic
  queues:
    - name: "direct.queue1"
    - name: "direct.queue2"
    - name: "fanout.queue1"
    - name: "fanout.queue2"
    - name: "topic.queue1"
    - name: "topic.queue2"
  bindings:
    - exchange: "orders.direct"
      queue: "direct.queue1"
      pattern: "blue"
    - exchange: "orders.direct"
      queue: "direct.queue1"
      pattern: "red"
    - exchange: "orders.direct"
      queue: "direct.queue2"
      pattern: "yellow"
    - exchange: "orders.direct"
      queue: "direct.queue2"
      pattern: "red"
    - exchange: "orders.fanout"
      queue: "fanout.queue1"
    - exchange: "orders.fanout"
      queue: "fanout.queue2"
    - exchange: "orders.topic"
      queue: "topic.queue1"
      pattern: "china.#"
    - exchange: "orders.topic"
      queue: "topic.queue2"
      pattern: "#.news"
"##;
    let config = Config::from_yaml(yaml).unwrap();
    let router = Router::new();
    router.apply_topology(&config.topology).unwrap();
    router
}

#[test]
fn test_direct_exact_match() {
    let router = test_router();

    let mut red = router.route("orders.direct", "red").unwrap();
    red.sort();
    assert_eq!(red, vec!["direct.queue1", "direct.queue2"]);

    assert_eq!(
        router.route("orders.direct", "blue").unwrap(),
        vec!["direct.queue1"]
    );
    assert_eq!(
        router.route("orders.direct", "yellow").unwrap(),
        vec!["direct.queue2"]
    );
    // Exact and case-sensitive: no partial or case-folded matches.
    assert!(router.route("orders.direct", "Blue").unwrap().is_empty());
    assert!(router.route("orders.direct", "blu").unwrap().is_empty());
    assert!(router.route("orders.direct", "").unwrap().is_empty());
}

#[test]
fn test_fanout_ignores_routing_key() {
    let router = test_router();

    for key in ["anything", "", "red"] {
        let mut routed = router.route("orders.fanout", key).unwrap();
        routed.sort();
        assert_eq!(routed, vec!["fanout.queue1", "fanout.queue2"]);
    }
}

#[test]
fn test_topic_wildcard_match() {
    let router = test_router();

    let mut routed = router.route("orders.topic", "china.news").unwrap();
    routed.sort();
    assert_eq!(routed, vec!["topic.queue1", "topic.queue2"]);

    assert_eq!(
        router.route("orders.topic", "china.news.sport").unwrap(),
        vec!["topic.queue1"]
    );
    assert_eq!(
        router.route("orders.topic", "china.sport").unwrap(),
        vec!["topic.queue1"]
    );
    assert_eq!(
        router.route("orders.topic", "usa.news").unwrap(),
        vec!["topic.queue2"]
    );
    assert!(router.route("orders.topic", "usa.sport").unwrap().is_empty());
}

#[test]
fn test_route_unknown_exchange() {
    let router = test_router();
    assert!(matches!(
        router.route("nonexistent", "key"),
        Err(BrokerError::ExchangeNotFound(_))
    ));
}

#[tokio::test]
async fn test_publish_fanout_delivers_one_copy_each() {
    let router = test_router();

    let status = router
        .publish("orders.fanout", Message::text("", "broadcast"))
        .await
        .unwrap();
    assert_eq!(status, PublishStatus::Routed(2));

    let q1 = router.get_store("fanout.queue1").unwrap();
    let q2 = router.get_store("fanout.queue2").unwrap();
    assert_eq!(q1.pending_count().await, 1);
    assert_eq!(q2.pending_count().await, 1);
}

#[tokio::test]
async fn test_publish_dedups_overlapping_bindings() {
    let router = test_router();
    // Both of topic.queue1's bindings match; the queue still gets one copy.
    router
        .bind("orders.topic", "topic.queue1", "#.news")
        .unwrap();

    let status = router
        .publish("orders.topic", Message::text("china.news", "overlap"))
        .await
        .unwrap();
    // topic.queue1 matched twice (china.# and #.news), topic.queue2 once.
    assert_eq!(status, PublishStatus::Routed(2));
    let q1 = router.get_store("topic.queue1").unwrap();
    let q2 = router.get_store("topic.queue2").unwrap();
    assert_eq!(q1.pending_count().await, 1);
    assert_eq!(q2.pending_count().await, 1);
}

#[tokio::test]
async fn test_publish_unroutable() {
    let router = test_router();
    let status = router
        .publish("orders.direct", Message::text("green", "nobody"))
        .await
        .unwrap();
    assert_eq!(status, PublishStatus::Unroutable);

    // No queue received anything.
    for queue in router.queue_names() {
        let store = router.get_store(&queue).unwrap();
        assert_eq!(store.pending_count().await, 0, "queue {queue} not empty");
    }
}

#[tokio::test]
async fn test_publish_unknown_exchange_is_error() {
    let router = test_router();
    assert!(matches!(
        router.publish("nonexistent", Message::text("k", "m")).await,
        Err(BrokerError::ExchangeNotFound(_))
    ));
}

#[tokio::test]
async fn test_default_exchange_routes_by_queue_name() {
    let router = test_router();

    let status = router
        .publish("", Message::text("direct.queue1", "hello"))
        .await
        .unwrap();
    assert_eq!(status, PublishStatus::Routed(1));
    let store = router.get_store("direct.queue1").unwrap();
    assert_eq!(store.pending_count().await, 1);

    let status = router
        .publish("", Message::text("no.such.queue", "hello"))
        .await
        .unwrap();
    assert_eq!(status, PublishStatus::Unroutable);
}

#[test]
fn test_default_exchange_accepts_no_bindings() {
    let router = test_router();
    assert!(matches!(
        router.bind("", "direct.queue1", "anything"),
        Err(BrokerError::ExchangeNotFound(_))
    ));
}

#[test]
fn test_exchange_redeclaration() {
    let router = test_router();

    // Identical redeclaration is a no-op.
    router
        .declare_exchange("orders.direct", ExchangeKind::Direct)
        .unwrap();

    // Different kind conflicts.
    let err = router
        .declare_exchange("orders.direct", ExchangeKind::Fanout)
        .unwrap_err();
    assert!(matches!(err, BrokerError::KindConflict { .. }));
}

#[test]
fn test_queue_redeclaration() {
    let router = test_router();

    router
        .declare_queue(&QueueConfig::new("direct.queue1"))
        .unwrap();

    let mut changed = QueueConfig::new("direct.queue1");
    changed.durable = true;
    assert!(matches!(
        router.declare_queue(&changed),
        Err(BrokerError::QueueConflict(_))
    ));
}

#[tokio::test]
async fn test_binding_redeclaration_is_idempotent() {
    let router = test_router();

    // Declaring the exact same binding again must not double-deliver.
    router
        .bind("orders.direct", "direct.queue1", "blue")
        .unwrap();

    let status = router
        .publish("orders.direct", Message::text("blue", "once"))
        .await
        .unwrap();
    assert_eq!(status, PublishStatus::Routed(1));
    let store = router.get_store("direct.queue1").unwrap();
    assert_eq!(store.pending_count().await, 1);
}

#[test]
fn test_bind_unknown_references() {
    let router = test_router();

    assert!(matches!(
        router.bind("nonexistent", "direct.queue1", "k"),
        Err(BrokerError::ExchangeNotFound(_))
    ));
    assert!(matches!(
        router.bind("orders.direct", "nonexistent", "k"),
        Err(BrokerError::QueueNotFound(_))
    ));
}

#[test]
fn test_apply_topology_is_idempotent() {
    let yaml = r#"
topology:
  exchanges:
    - name: "x"
      kind: direct
  queues:
    - name: "q"
  bindings:
    - exchange: "x"
      queue: "q"
      pattern: "k"
"#;
    let config = Config::from_yaml(yaml).unwrap();
    let router = Router::new();
    router.apply_topology(&config.topology).unwrap();
    // Re-applying the identical topology at restart must succeed.
    router.apply_topology(&config.topology).unwrap();

    assert_eq!(router.route("x", "k").unwrap(), vec!["q"]);
}

#[test]
fn test_apply_topology_conflict_aborts() {
    let router = test_router();
    let yaml = r#"
topology:
  exchanges:
    - name: "orders.direct"
      kind: topic
  queues: []
  bindings: []
"#;
    let config = Config::from_yaml(yaml).unwrap();
    assert!(matches!(
        router.apply_topology(&config.topology),
        Err(BrokerError::KindConflict { .. })
    ));
}

#[tokio::test]
async fn test_publish_full_queue() {
    let router = Router::new();
    router
        .declare_exchange("x", ExchangeKind::Direct)
        .unwrap();
    let mut queue = QueueConfig::new("small");
    queue.max_size = 2;
    router.declare_queue(&queue).unwrap();
    router.bind("x", "small", "k").unwrap();

    for i in 0..2 {
        let status = router
            .publish("x", Message::text("k", format!("msg-{i}")))
            .await
            .unwrap();
        assert_eq!(status, PublishStatus::Routed(1), "message {i}");
    }
    let status = router
        .publish("x", Message::text("k", "overflow"))
        .await
        .unwrap();
    assert_eq!(status, PublishStatus::Full("small".to_string()));
}

#[test]
fn test_has_exchange() {
    let router = test_router();
    assert!(router.has_exchange("orders.direct"));
    assert!(router.has_exchange(""));
    assert!(!router.has_exchange("nonexistent"));
}
