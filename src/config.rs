//! Configuration loading for topology and retry policy.
//!
//! The topology section declares exchanges, queues, and bindings; it is
//! applied idempotently at startup, so re-running a process against an
//! already-declared topology is a no-op as long as nothing conflicts.
//! The retry section configures the consumer-side retry and recovery
//! behavior shared by all registered handlers.

use anyhow::Result;
use serde::Deserialize;
use std::fs::File;
use std::io::Read;

use crate::exchange::ExchangeKind;

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ExchangeConfig {
    pub name: String,
    pub kind: ExchangeKind,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct QueueConfig {
    pub name: String,
    /// Declared durability. Carried as metadata only; the engine itself
    /// keeps no persistent storage.
    #[serde(default)]
    pub durable: bool,
    /// Max unacknowledged messages a single consumer may hold.
    #[serde(default = "default_prefetch")]
    pub prefetch: usize,
    /// Maximum number of messages the queue can hold. 0 = unbounded.
    #[serde(default)]
    pub max_size: usize,
    /// Default message TTL in milliseconds applied to messages that carry
    /// no expiration of their own. 0 = no default TTL.
    #[serde(default)]
    pub message_ttl_ms: u64,
    /// Exchange expired messages are re-routed through. `None` means
    /// expired messages are discarded.
    #[serde(default)]
    pub dead_letter_exchange: Option<String>,
    /// Routing key used for dead-letter re-routing. Falls back to the
    /// message's original routing key when not set.
    #[serde(default)]
    pub dead_letter_routing_key: Option<String>,
}

impl QueueConfig {
    pub fn new(name: &str) -> Self {
        QueueConfig {
            name: name.to_string(),
            durable: false,
            prefetch: default_prefetch(),
            max_size: 0,
            message_ttl_ms: 0,
            dead_letter_exchange: None,
            dead_letter_routing_key: None,
        }
    }
}

fn default_prefetch() -> usize {
    1
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BindingConfig {
    pub exchange: String,
    pub queue: String,
    /// Exact routing key for direct exchanges, wildcard pattern for topic
    /// exchanges, ignored for fanout.
    #[serde(default)]
    pub pattern: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Topology {
    pub exchanges: Vec<ExchangeConfig>,
    pub queues: Vec<QueueConfig>,
    pub bindings: Vec<BindingConfig>,
}

/// What to do with a message once its retries are exhausted (or its
/// handler reported a fatal failure).
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryStrategyKind {
    /// Discard the message and report a terminal failure.
    #[default]
    Reject,
    /// Put the message back at the tail of its queue with the attempt
    /// counter reset. If the failure is deterministic this loops forever;
    /// that hazard is inherent to the strategy and is not guarded against.
    Requeue,
    /// Re-publish the message to a configured exchange with trace headers
    /// recording the original queue, routing key, and failure summary.
    Republish,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RepublishTarget {
    pub exchange: String,
    pub routing_key: String,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RetryConfig {
    /// When false, every message gets exactly one delivery attempt before
    /// the recovery strategy fires.
    #[serde(default)]
    pub enabled: bool,
    /// Total delivery attempts per message, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first redelivery, in milliseconds.
    #[serde(default = "default_initial_interval_ms")]
    pub initial_interval_ms: u64,
    /// Backoff multiplier applied per additional attempt.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Upper bound on the computed backoff, in milliseconds.
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,
    /// Per-attempt wall-clock limit for the handler, in milliseconds.
    /// 0 = attempts are unbounded in time.
    #[serde(default)]
    pub attempt_timeout_ms: u64,
    #[serde(default)]
    pub recovery_strategy: RecoveryStrategyKind,
    /// Target for the republish strategy. Required when
    /// `recovery_strategy` is `republish`.
    #[serde(default)]
    pub republish: Option<RepublishTarget>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_interval_ms() -> u64 {
    1000
}

fn default_multiplier() -> f64 {
    1.0
}

fn default_max_interval_ms() -> u64 {
    10_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            enabled: false,
            max_attempts: default_max_attempts(),
            initial_interval_ms: default_initial_interval_ms(),
            multiplier: default_multiplier(),
            max_interval_ms: default_max_interval_ms(),
            attempt_timeout_ms: 0,
            recovery_strategy: RecoveryStrategyKind::Reject,
            republish: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub topology: Topology,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Config {
    /// Loads configuration from a YAML file.
    pub fn load(path: &str) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut content = String::new();
        file.read_to_string(&mut content)?;
        Self::from_yaml(&content)
    }

    /// Parses configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }
}
