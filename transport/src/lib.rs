//! Move payloads between the delivery engine and its observers.
//!
//! The engine never talks to a broker directly. It publishes opaque payloads to a [Route] and
//! subscribes to routes for inbound traffic through the [Transport] trait. Two implementations
//! are provided:
//!
//! - [memory::Bus]: an in-process router that fans payloads out to every live subscriber.
//! - [resilient::Resilient]: wraps another transport with bounded retries, exponential backoff,
//!   and a degraded fallback (usually a [memory::Bus]) once retries are exhausted.
//!
//! # Status
//!
//! `courier-transport` is **ALPHA** software. Developers should expect breaking changes.

use bytes::Bytes;
use futures::Stream;
use std::{fmt, future::Future, pin::Pin};
use thiserror::Error;

pub mod memory;
pub mod resilient;

/// Errors that can occur when interacting with a [Transport].
#[derive(Debug, Error)]
pub enum Error {
    #[error("transport closed")]
    Closed,
    #[error("publish to {0} failed: {1}")]
    PublishFailed(Route, String),
    #[error("subscribe to {0} failed: {1}")]
    SubscribeFailed(Route, String),
}

/// Destination (or source) of a payload.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Route {
    /// The inbox of a single node.
    Node(String),
    /// A named stream any number of observers can follow.
    Topic(String),
}

impl Route {
    /// Route to the inbox of `node`.
    pub fn node(node: impl Into<String>) -> Self {
        Self::Node(node.into())
    }

    /// Route to the topic `name`.
    pub fn topic(name: impl Into<String>) -> Self {
        Self::Topic(name.into())
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node(node) => write!(f, "node-{node}"),
            Self::Topic(name) => write!(f, "topic-{name}"),
        }
    }
}

/// Long-lived stream of inbound payloads.
pub type Inbound = Pin<Box<dyn Stream<Item = Bytes> + Send>>;

/// Capability to send payloads to a [Route] and follow the payloads sent to one.
pub trait Transport: Clone + Send + Sync + 'static {
    /// Send `payload` to every current subscriber of `route`.
    ///
    /// Returns the number of subscribers reached (zero is a valid outcome). Failures are always
    /// reported to the caller.
    fn publish(
        &self,
        route: &Route,
        payload: Bytes,
    ) -> impl Future<Output = Result<usize, Error>> + Send;

    /// Follow all payloads published to `route` after this call returns.
    fn subscribe(&self, route: &Route) -> impl Future<Output = Result<Inbound, Error>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_display() {
        assert_eq!(Route::node("A").to_string(), "node-A");
        assert_eq!(Route::topic("metrics").to_string(), "topic-metrics");
    }

    #[test]
    fn test_route_ordering() {
        assert!(Route::node("A") < Route::node("B"));
        assert!(Route::node("Z") < Route::topic("A"));
    }
}
