//! Deliver submitted messages over the simulated network.
//!
//! Every delivery unit (a Direct message, or a single recipient of a PubSub message) runs in its
//! own task, tracked by the [Engine] so [Engine::shutdown] can cancel and await all of them.

use crate::{
    config::{ConfigStore, ConfigUpdate, SimulationConfig},
    ledger::AckLedger,
    metrics::{MetricsAggregator, Snapshot},
    subscribers::SubscriberSet,
    types::{Message, MessageId, Method, NodeId},
    wire::Event,
    Error,
};
use courier_transport::{Route, Transport};
use prometheus_client::registry::Registry;
use std::{future::Future, sync::Arc, time::Duration};
use tokio::{
    select,
    sync::{OwnedSemaphorePermit, Semaphore},
    task::JoinHandle,
    time::{interval, Instant, MissedTickBehavior},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info};

mod config;
pub use config::Config;
mod direct;
mod handle;
pub use handle::{DeliveryHandle, Outcome, RecipientOutcome};
mod pubsub;

/// Shared state of an [Engine].
struct Shared<T: Transport> {
    transport: T,
    config: ConfigStore,
    ledger: AckLedger,
    metrics: MetricsAggregator,
    subscribers: SubscriberSet,

    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    prune_interval: Duration,
}

/// Delivery engine for Direct and PubSub messages.
///
/// Cheap to clone: all clones share the same state.
pub struct Engine<T: Transport> {
    shared: Arc<Shared<T>>,
}

impl<T: Transport> Clone for Engine<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Transport> Engine<T> {
    /// Create a new engine, registering its metrics with `registry`.
    pub fn new(transport: T, registry: &mut Registry, cfg: Config) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                config: ConfigStore::new(cfg.simulation),
                ledger: AckLedger::new(cfg.ledger_ttl),
                metrics: MetricsAggregator::init(registry, cfg.latency_retention),
                subscribers: SubscriberSet::new(),
                permits: Arc::new(Semaphore::new(cfg.max_in_flight.max(1))),
                tracker: TaskTracker::new(),
                cancel: CancellationToken::new(),
                prune_interval: cfg.prune_interval,
            }),
        }
    }

    /// Start the background task that prunes the ack ledger.
    pub fn start(&self) -> JoinHandle<()> {
        let engine = self.clone();
        self.spawn(async move { engine.prune().await })
    }

    /// Submit `content` from `sender` for delivery with `method`.
    ///
    /// Returns as soon as the message is accepted. `target` is required for [Method::Direct] and
    /// ignored for [Method::PubSub].
    pub fn submit(
        &self,
        sender: impl Into<NodeId>,
        target: Option<NodeId>,
        method: Method,
        content: impl Into<String>,
    ) -> Result<DeliveryHandle, Error> {
        match method {
            Method::Direct => self.submit_direct(Message::new(sender, target, content)),
            Method::PubSub => self.submit_pubsub(Message::new(sender, None, content)),
        }
    }

    /// Deliver `message` to its target at most once.
    pub fn submit_direct(&self, message: Message) -> Result<DeliveryHandle, Error> {
        self.ensure_running()?;
        let Some(target) = message.target().map(str::to_string) else {
            return Err(Error::MissingTarget);
        };
        self.shared.metrics.record_sent(Method::Direct);
        debug!(msg_id = %message.id(), target, "submitted direct");

        let id = message.id();
        let engine = self.clone();
        let task = self.spawn(async move { engine.deliver_direct(message).await });
        Ok(DeliveryHandle::new(id, Method::Direct, vec![(target, task)]))
    }

    /// Deliver `message` to every node subscribed at this instant, retrying until each
    /// acknowledges it or the retry budget is exhausted.
    pub fn submit_pubsub(&self, message: Message) -> Result<DeliveryHandle, Error> {
        self.ensure_running()?;
        self.shared.metrics.record_sent(Method::PubSub);

        // Recipients and the retry budget are fixed at publish time
        let recipients = self.shared.subscribers.snapshot();
        let config = self.shared.config.get();
        let budget = pubsub::Budget {
            max_retries: config.max_retries(),
            ack_timeout: config.ack_timeout(),
        };
        debug!(
            msg_id = %message.id(),
            recipients = recipients.len(),
            max_retries = budget.max_retries,
            "submitted pubsub"
        );

        let id = message.id();
        let message = Arc::new(message);
        let tasks = recipients
            .into_iter()
            .map(|recipient| {
                let engine = self.clone();
                let message = message.clone();
                let task = {
                    let recipient = recipient.clone();
                    self.spawn(async move { engine.deliver_pubsub(message, recipient, budget).await })
                };
                (recipient, task)
            })
            .collect();
        Ok(DeliveryHandle::new(id, Method::PubSub, tasks))
    }

    /// Record that `recipient` acknowledged `message`.
    ///
    /// Returns `true` if the acknowledgment is new.
    pub fn record_ack(&self, message: MessageId, recipient: &str) -> bool {
        self.shared.ledger.record_ack(message, recipient)
    }

    /// Subscribe `node` to PubSub messages published from now on.
    pub fn join(&self, node: impl Into<NodeId>) -> bool {
        self.shared.subscribers.join(node)
    }

    /// Release one subscription of `node`.
    pub fn leave(&self, node: &str) -> bool {
        self.shared.subscribers.leave(node)
    }

    /// Apply a partial config update (clamped) and return the resulting config.
    pub fn update_config(&self, update: &ConfigUpdate) -> SimulationConfig {
        self.shared.config.update(update)
    }

    pub fn snapshot(&self) -> Snapshot {
        self.shared.metrics.snapshot()
    }

    pub fn transport(&self) -> &T {
        &self.shared.transport
    }

    pub fn config(&self) -> &ConfigStore {
        &self.shared.config
    }

    pub fn ledger(&self) -> &AckLedger {
        &self.shared.ledger
    }

    pub fn metrics(&self) -> &MetricsAggregator {
        &self.shared.metrics
    }

    pub fn subscribers(&self) -> &SubscriberSet {
        &self.shared.subscribers
    }

    /// Token cancelled once [Engine::shutdown] is called.
    pub fn cancellation(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    /// Cancel every outstanding delivery and background task, then wait for them to stop.
    ///
    /// Cancelled deliveries record no outcome. Any later submission fails with
    /// [Error::ShuttingDown].
    pub async fn shutdown(&self) {
        info!(in_flight = self.shared.tracker.len(), "shutting down");
        self.shared.cancel.cancel();
        self.shared.tracker.close();
        self.shared.tracker.wait().await;
        debug!("shutdown complete");
    }

    /// Spawn a task that [Engine::shutdown] waits for.
    pub(crate) fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.shared.tracker.spawn(future)
    }

    /// Publish `event` to `route`.
    ///
    /// Fails with [Error::ShuttingDown] if the engine shuts down before the transport returns
    /// (e.g. while it is backing off).
    pub(crate) async fn emit(&self, route: &Route, event: &Event) -> Result<usize, Error> {
        let payload = event.encode()?;
        select! {
            biased;
            _ = self.shared.cancel.cancelled() => Err(Error::ShuttingDown),
            result = self.shared.transport.publish(route, payload) => Ok(result?),
        }
    }

    fn ensure_running(&self) -> Result<(), Error> {
        if self.shared.cancel.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        Ok(())
    }

    /// Wait for a delivery slot.
    ///
    /// Returns `None` if the engine shuts down first.
    async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        select! {
            biased;
            _ = self.shared.cancel.cancelled() => None,
            permit = self.shared.permits.clone().acquire_owned() => permit.ok(),
        }
    }

    /// Sleep for `duration`.
    ///
    /// Returns `false` if the engine shuts down first.
    async fn pause(&self, duration: Duration) -> bool {
        select! {
            biased;
            _ = self.shared.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    async fn prune(&self) {
        let mut ticker = interval(self.shared.prune_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            select! {
                _ = self.shared.cancel.cancelled() => {
                    debug!("pruner stopped");
                    return;
                },
                _ = ticker.tick() => {
                    self.shared.ledger.prune(Instant::now());
                },
            }
        }
    }
}
