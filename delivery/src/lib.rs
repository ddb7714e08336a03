//! Simulate Direct and PubSub delivery over an unreliable network.
//!
//! # Overview
//!
//! Messages are submitted to an [Engine] with one of two delivery [Method]s:
//!
//! - [Method::Direct]: point-to-point and at-most-once. The message is delayed by a simulated
//!   latency and then either delivered to its target or lost (never retried).
//! - [Method::PubSub]: fan-out to every node in the [SubscriberSet] at publish time. Each
//!   recipient runs an independent sequence of attempts, each waiting (up to the ack timeout) for
//!   the recipient to acknowledge it in the [AckLedger]. Unacknowledged attempts are retried until
//!   the retry budget is exhausted.
//!
//! Simulation parameters live in a [ConfigStore] and can be changed at any time. Every terminal
//! outcome is recorded in a [MetricsAggregator], which a [Broadcaster] periodically publishes to
//! observers (along with any config change).
//!
//! Payloads move through the [courier_transport::Transport] capability, so the engine never
//! depends on a particular broker.
//!
//! # Status
//!
//! `courier-delivery` is **ALPHA** software. Developers should expect breaking changes.

use thiserror::Error;

pub mod broadcaster;
pub mod config;
pub mod engine;
pub mod ledger;
pub mod listener;
pub mod metrics;
pub mod subscribers;
pub mod types;
pub mod wire;

pub use broadcaster::Broadcaster;
pub use config::{ConfigStore, ConfigUpdate, SimulationConfig};
pub use engine::{Config, DeliveryHandle, Engine, Outcome, RecipientOutcome};
pub use ledger::{AckLedger, AckRecord};
pub use listener::AckListener;
pub use metrics::{MetricsAggregator, MethodSnapshot, Snapshot};
pub use subscribers::SubscriberSet;
pub use types::{Message, MessageId, Method, NodeId};

/// Errors that can occur when interacting with the delivery engine.
#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown method: {0}")]
    UnknownMethod(String),
    #[error("invalid message id: {0}")]
    InvalidMessageId(String),
    #[error("direct message requires a target")]
    MissingTarget,
    #[error("engine shutting down")]
    ShuttingDown,
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("transport error: {0}")]
    Transport(#[from] courier_transport::Error),
}
