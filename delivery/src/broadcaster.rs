//! Periodically publish metrics snapshots (and config changes) to observers.

use crate::{
    config::SimulationConfig,
    engine::Engine,
    wire::{Event, CONFIG_TOPIC, METRICS_TOPIC},
    Error,
};
use courier_transport::{Route, Transport};
use std::time::Duration;
use tokio::{
    select,
    sync::watch,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, warn};

/// Default time between metrics snapshots.
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(500);

/// Publishes a [crate::metrics::Snapshot] to the metrics topic every interval, and the full
/// config to the config topic whenever it changes.
///
/// Ticks missed because a publish was slow are skipped rather than bursted. The loop stops once
/// the [Engine] shuts down.
pub struct Broadcaster<T: Transport> {
    engine: Engine<T>,
    interval: Duration,
}

impl<T: Transport> Broadcaster<T> {
    pub fn new(engine: Engine<T>, interval: Duration) -> Self {
        Self { engine, interval }
    }

    /// Start the broadcaster on the engine's task tracker.
    ///
    /// Config changes made after this call returns are always relayed.
    pub fn start(self) -> JoinHandle<()> {
        let config = self.engine.config().subscribe();
        let engine = self.engine.clone();
        engine.spawn(self.run(config))
    }

    async fn run(self, mut config: watch::Receiver<SimulationConfig>) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let cancel = self.engine.cancellation();
        let metrics_route = Route::topic(METRICS_TOPIC);
        let config_route = Route::topic(CONFIG_TOPIC);
        loop {
            select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("broadcaster stopped");
                    return;
                },
                result = config.changed() => {
                    if result.is_err() {
                        debug!("config store dropped");
                        return;
                    }
                    let updated = *config.borrow_and_update();
                    self.publish(&config_route, &Event::ConfigUpdated(updated)).await;
                },
                _ = ticker.tick() => {
                    let snapshot = self.engine.snapshot();
                    self.publish(&metrics_route, &Event::MetricsUpdate(snapshot)).await;
                },
            }
        }
    }

    async fn publish(&self, route: &Route, event: &Event) {
        match self.engine.emit(route, event).await {
            Ok(_) | Err(Error::ShuttingDown) => {}
            Err(err) => warn!(%route, ?err, "failed to broadcast"),
        }
    }
}
