//! In-process implementation of [Transport].

use crate::{Error, Inbound, Route, Transport};
use bytes::Bytes;
use futures::channel::mpsc;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tracing::{debug, trace};

/// Routes payloads between tasks of the same process.
///
/// Every subscriber receives its own unbounded stream, so a slow subscriber never blocks a
/// publisher (or any other subscriber). Subscribers that drop their stream are pruned on the next
/// publish to their route.
#[derive(Clone, Default)]
pub struct Bus {
    inner: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    closed: bool,
    routes: HashMap<Route, Vec<mpsc::UnboundedSender<Bytes>>>,
}

impl Bus {
    /// Create a new, empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the bus.
    ///
    /// All inbound streams terminate and any further `publish` or `subscribe` fails with
    /// [Error::Closed].
    pub fn close(&self) {
        let mut state = self.inner.lock().unwrap();
        state.closed = true;
        state.routes.clear();
        debug!("bus closed");
    }

    /// Number of live subscribers following `route`.
    pub fn subscribers(&self, route: &Route) -> usize {
        let state = self.inner.lock().unwrap();
        state
            .routes
            .get(route)
            .map_or(0, |senders| senders.iter().filter(|s| !s.is_closed()).count())
    }
}

impl Transport for Bus {
    async fn publish(&self, route: &Route, payload: Bytes) -> Result<usize, Error> {
        let mut state = self.inner.lock().unwrap();
        if state.closed {
            return Err(Error::Closed);
        }
        let Some(senders) = state.routes.get_mut(route) else {
            trace!(%route, "no subscribers");
            return Ok(0);
        };

        // Deliver to every live subscriber, dropping any that went away
        senders.retain(|sender| sender.unbounded_send(payload.clone()).is_ok());
        let reached = senders.len();
        if senders.is_empty() {
            state.routes.remove(route);
        }
        trace!(%route, reached, "published");
        Ok(reached)
    }

    async fn subscribe(&self, route: &Route) -> Result<Inbound, Error> {
        let mut state = self.inner.lock().unwrap();
        if state.closed {
            return Err(Error::Closed);
        }
        let (sender, receiver) = mpsc::unbounded();
        state.routes.entry(route.clone()).or_default().push(sender);
        debug!(%route, "subscribed");
        Ok(Box::pin(receiver))
    }
}
