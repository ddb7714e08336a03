//! Identifiers and the immutable [Message] submitted to the engine.

use crate::Error;
use prometheus_client::encoding::EncodeLabelValue;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    str::FromStr,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tokio::time::Instant;
use uuid::Uuid;

/// Identifier of a node (sender or recipient).
pub type NodeId = String;

/// Delivery semantics requested for a message.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, EncodeLabelValue,
)]
pub enum Method {
    /// Point-to-point, at-most-once, no retry.
    Direct,
    /// Fan-out to all subscribers, retried until acknowledged or exhausted.
    PubSub,
}

impl Method {
    /// All methods, in a stable order.
    pub const ALL: [Method; 2] = [Method::Direct, Method::PubSub];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "Direct",
            Self::PubSub => "PubSub",
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            Self::Direct => 0,
            Self::PubSub => 1,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Direct" | "direct" => Ok(Self::Direct),
            "PubSub" | "pubsub" => Ok(Self::PubSub),
            other => Err(Error::UnknownMethod(other.to_string())),
        }
    }
}

/// Unique identifier of a [Message].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Generate a new random identifier.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for MessageId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| Error::InvalidMessageId(s.to_string()))
    }
}

/// A message submitted for delivery.
///
/// Immutable once created.
#[derive(Clone, Debug)]
pub struct Message {
    id: MessageId,
    sender: NodeId,
    target: Option<NodeId>,
    content: String,
    submitted_at: Instant,
}

impl Message {
    /// Create a new message, stamped with the current (monotonic) time.
    pub fn new(sender: impl Into<NodeId>, target: Option<NodeId>, content: impl Into<String>) -> Self {
        Self {
            id: MessageId::random(),
            sender: sender.into(),
            target,
            content: content.into(),
            submitted_at: Instant::now(),
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    /// Only set for Direct delivery.
    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// Time elapsed since submission (end-to-end latency once delivered).
    pub fn elapsed(&self) -> Duration {
        self.submitted_at.elapsed()
    }
}

/// Seconds since the Unix epoch, as reported to observers.
pub fn epoch_seconds(time: SystemTime) -> f64 {
    time.duration_since(UNIX_EPOCH)
        .map_or(0.0, |duration| duration.as_secs_f64())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_parse() {
        assert_eq!("Direct".parse::<Method>().unwrap(), Method::Direct);
        assert_eq!("pubsub".parse::<Method>().unwrap(), Method::PubSub);
        assert!(matches!(
            "Broadcast".parse::<Method>(),
            Err(Error::UnknownMethod(_))
        ));
    }

    #[test]
    fn test_message_ids_unique() {
        let a = Message::new("A", Some("B".into()), "hi");
        let b = Message::new("A", Some("B".into()), "hi");
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id().to_string().parse::<MessageId>().unwrap(), a.id());
    }

    #[test]
    fn test_invalid_message_id() {
        assert!(matches!(
            "not-a-uuid".parse::<MessageId>(),
            Err(Error::InvalidMessageId(_))
        ));
    }
}
