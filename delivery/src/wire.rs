//! JSON events exchanged with nodes and observers.

use crate::{
    config::SimulationConfig,
    metrics::Snapshot,
    types::{epoch_seconds, Message, MessageId, Method, NodeId},
    Error,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Topic observers follow for periodic metrics snapshots.
pub const METRICS_TOPIC: &str = "metrics";

/// Topic observers follow for config changes.
pub const CONFIG_TOPIC: &str = "config";

/// Topic nodes report PubSub acknowledgments to.
pub const ACKS_TOPIC: &str = "acks";

/// Why a Direct message was not delivered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    SimulatedLoss,
    TransportFailure,
}

/// A message as it reaches its recipient.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Delivered {
    pub msg_id: MessageId,
    pub from: NodeId,
    pub to: Option<NodeId>,
    pub content: String,
    pub method: Method,
    /// Attempt number (PubSub only, starting at 1).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    /// Wall-clock time of emission, in seconds since the Unix epoch.
    pub ts: f64,
}

impl Delivered {
    /// Direct delivery of `message` to its target.
    pub fn direct(message: &Message) -> Self {
        Self::new(message, message.target().map(str::to_string), Method::Direct, None)
    }

    /// PubSub delivery attempt `attempt` of `message` to `recipient`.
    pub fn pubsub(message: &Message, recipient: &str, attempt: u32) -> Self {
        Self::new(
            message,
            Some(recipient.to_string()),
            Method::PubSub,
            Some(attempt),
        )
    }

    fn new(message: &Message, to: Option<NodeId>, method: Method, attempt: Option<u32>) -> Self {
        Self {
            msg_id: message.id(),
            from: message.sender().to_string(),
            to,
            content: message.content().to_string(),
            method,
            attempt,
            ts: epoch_seconds(std::time::SystemTime::now()),
        }
    }
}

/// Events sent to nodes and observers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Sent to the submitter as soon as a message is accepted.
    SentAck { msg_id: MessageId, method: Method },
    /// Sent to the submitter of a Direct message that was not delivered.
    DeliveryFailed {
        msg_id: MessageId,
        method: Method,
        reason: FailureReason,
    },
    /// A Direct message reaching its target.
    Message(Delivered),
    /// A PubSub attempt reaching a subscriber.
    PubsubMessage(Delivered),
    /// Periodic summary of every method.
    MetricsUpdate(Snapshot),
    /// The full config after a change.
    ConfigUpdated(SimulationConfig),
}

impl Event {
    pub fn encode(&self) -> Result<Bytes, Error> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(payload: &[u8]) -> Result<Self, Error> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Acknowledgment reported by a node for a PubSub attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub msg_id: MessageId,
    pub node: NodeId,
}

impl Ack {
    pub fn new(msg_id: MessageId, node: impl Into<NodeId>) -> Self {
        Self {
            msg_id,
            node: node.into(),
        }
    }

    pub fn encode(&self) -> Result<Bytes, Error> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Parse an acknowledgment report.
    ///
    /// Fails with [Error::Malformed] if the payload is not JSON, lacks either field, or names
    /// an empty node.
    pub fn decode(payload: &[u8]) -> Result<Self, Error> {
        let ack: Self =
            serde_json::from_slice(payload).map_err(|err| Error::Malformed(err.to_string()))?;
        if ack.node.is_empty() {
            return Err(Error::Malformed("empty node".into()));
        }
        Ok(ack)
    }
}
