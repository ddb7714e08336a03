//! Record acknowledgments reported by nodes.

use crate::{
    engine::Engine,
    wire::{Ack, ACKS_TOPIC},
    Error,
};
use courier_transport::{Route, Transport};
use futures::StreamExt;
use prometheus_client::{metrics::counter::Counter, registry::Registry};
use tokio::{select, task::JoinHandle};
use tracing::{debug, trace, warn};

/// Metrics for the [AckListener].
#[derive(Default)]
pub struct Metrics {
    /// Number of new acknowledgments recorded
    pub recorded: Counter,
    /// Number of acknowledgments for pairs already acknowledged
    pub duplicate: Counter,
    /// Number of reports dropped because they could not be parsed
    pub malformed: Counter,
}

impl Metrics {
    /// Create and return a new set of metrics, registered with the given registry.
    pub fn init(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register(
            "acks_recorded",
            "Number of new acknowledgments recorded",
            metrics.recorded.clone(),
        );
        registry.register(
            "acks_duplicate",
            "Number of acknowledgments for pairs already acknowledged",
            metrics.duplicate.clone(),
        );
        registry.register(
            "acks_malformed",
            "Number of reports dropped because they could not be parsed",
            metrics.malformed.clone(),
        );
        metrics
    }
}

/// Consumes the acks topic and records every well-formed report in the engine's ledger.
///
/// Malformed reports are dropped (with a diagnostic) and never stop the listener.
pub struct AckListener<T: Transport> {
    engine: Engine<T>,
    metrics: Metrics,
}

impl<T: Transport> AckListener<T> {
    pub fn new(engine: Engine<T>, registry: &mut Registry) -> Self {
        Self {
            engine,
            metrics: Metrics::init(registry),
        }
    }

    /// Subscribe to the acks topic and start consuming it on the engine's task tracker.
    ///
    /// Reports published after this call returns are never missed.
    pub async fn start(self) -> Result<JoinHandle<()>, Error> {
        let mut inbound = self
            .engine
            .transport()
            .subscribe(&Route::topic(ACKS_TOPIC))
            .await?;
        let engine = self.engine.clone();
        let cancel = engine.cancellation();
        Ok(engine.spawn(async move {
            loop {
                select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!("ack listener stopped");
                        return;
                    },
                    payload = inbound.next() => {
                        let Some(payload) = payload else {
                            debug!("ack stream closed");
                            return;
                        };
                        self.handle(&payload);
                    },
                }
            }
        }))
    }

    fn handle(&self, payload: &[u8]) {
        let ack = match Ack::decode(payload) {
            Ok(ack) => ack,
            Err(err) => {
                warn!(?err, "dropping malformed ack");
                self.metrics.malformed.inc();
                return;
            }
        };
        if self.engine.record_ack(ack.msg_id, &ack.node) {
            trace!(msg_id = %ack.msg_id, node = %ack.node, "ack recorded");
            self.metrics.recorded.inc();
        } else {
            self.metrics.duplicate.inc();
        }
    }
}
