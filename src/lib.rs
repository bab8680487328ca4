//! In-process RabbitMQ-style message routing and delivery engine.
//!
//! Implements the broker semantics an application sees, without the wire
//! protocol: exchange routing (direct / fanout / topic), binding-based
//! fan-out, competing-consumer work queues with prefetch accounting,
//! consumer retry with configurable recovery, producer confirm/return
//! tracking, and TTL expiration with dead-letter re-routing.
//!
//! The pieces are constructed once and passed by reference:
//!
//! ```no_run
//! use std::sync::Arc;
//! use fast_rabbitmq_emulator::config::Config;
//! use fast_rabbitmq_emulator::confirm::ConfirmTracker;
//! use fast_rabbitmq_emulator::publisher::Publisher;
//! use fast_rabbitmq_emulator::router::Router;
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = Config::load("topology.yaml")?;
//! let router = Arc::new(Router::new());
//! router.apply_topology(&config.topology)?;
//!
//! let tracker = Arc::new(ConfirmTracker::new());
//! let publisher = Publisher::new(router.clone(), tracker.clone());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod confirm;
pub mod dispatcher;
pub mod error;
pub mod exchange;
pub mod message;
pub mod publisher;
pub mod retry;
pub mod router;
pub mod store;
