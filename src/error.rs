//! Error taxonomy for the broker engine.
//!
//! Declaration-time errors (`ExchangeNotFound`, `QueueNotFound`,
//! `KindConflict`, `QueueConflict`, `Config`) are fatal to topology setup
//! and should abort startup. Per-message conditions are deliberately *not*
//! errors: a publish that matches no binding surfaces as a `Returned`
//! outcome on the publish handle, and consumer handler failures are
//! absorbed by the retry policy.

use thiserror::Error;

use crate::exchange::ExchangeKind;

#[derive(Debug, Error)]
pub enum BrokerError {
    /// A binding or publish referenced an exchange that was never declared.
    #[error("exchange '{0}' does not exist")]
    ExchangeNotFound(String),

    /// A binding or consumer referenced a queue that was never declared.
    #[error("queue '{0}' does not exist")]
    QueueNotFound(String),

    /// An exchange was redeclared with a different kind.
    #[error("exchange '{name}' is declared as {existing}, cannot redeclare as {requested}")]
    KindConflict {
        name: String,
        existing: ExchangeKind,
        requested: ExchangeKind,
    },

    /// A queue was redeclared with different settings. Identical
    /// redeclaration is an idempotent no-op.
    #[error("queue '{0}' is already declared with different settings")]
    QueueConflict(String),

    /// The configuration is internally inconsistent (e.g. a republish
    /// recovery strategy without a republish target).
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A message payload could not be encoded.
    #[error("failed to encode message payload: {0}")]
    Payload(#[from] serde_json::Error),
}
