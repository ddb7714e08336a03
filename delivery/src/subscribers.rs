//! Nodes eligible for PubSub fan-out.

use crate::types::NodeId;
use std::{collections::BTreeMap, sync::RwLock};
use tracing::debug;

/// Set of subscribed nodes.
///
/// A node may be joined by multiple sessions at once: it stays subscribed until every session
/// that joined it has left.
#[derive(Default)]
pub struct SubscriberSet {
    // Map from Node => number of sessions that joined it
    nodes: RwLock<BTreeMap<NodeId, usize>>,
}

impl SubscriberSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `node`.
    ///
    /// Returns `true` if `node` was not subscribed before.
    pub fn join(&self, node: impl Into<NodeId>) -> bool {
        let node = node.into();
        let mut nodes = self.nodes.write().unwrap();
        let sessions = nodes.entry(node.clone()).or_default();
        *sessions += 1;
        let added = *sessions == 1;
        if added {
            debug!(node, "joined");
        }
        added
    }

    /// Release one session of `node`.
    ///
    /// Returns `true` if `node` is no longer subscribed.
    pub fn leave(&self, node: &str) -> bool {
        let mut nodes = self.nodes.write().unwrap();
        let Some(sessions) = nodes.get_mut(node) else {
            return false;
        };
        *sessions -= 1;
        if *sessions > 0 {
            return false;
        }
        nodes.remove(node);
        debug!(node, "left");
        true
    }

    pub fn contains(&self, node: &str) -> bool {
        self.nodes.read().unwrap().contains_key(node)
    }

    /// Subscribed nodes at this instant, in sorted order.
    pub fn snapshot(&self) -> Vec<NodeId> {
        self.nodes.read().unwrap().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
