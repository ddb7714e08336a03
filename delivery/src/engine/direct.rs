use super::{Engine, Outcome};
use crate::{
    types::{Message, Method},
    wire::{Delivered, Event, FailureReason},
    Error,
};
use courier_transport::{Route, Transport};
use rand::{rngs::StdRng, SeedableRng};
use tracing::{debug, warn};

impl<T: Transport> Engine<T> {
    /// Deliver a Direct message to its target (at most once).
    pub(super) async fn deliver_direct(self, message: Message) -> Outcome {
        let Some(_permit) = self.acquire().await else {
            return Outcome::Cancelled;
        };
        let Some(target) = message.target() else {
            return Outcome::Cancelled;
        };

        // Simulate the network
        let config = self.shared.config.get();
        let mut rng = StdRng::from_entropy();
        let latency = config.sample_latency(&mut rng);
        if !self.pause(latency).await {
            debug!(msg_id = %message.id(), "direct cancelled");
            return Outcome::Cancelled;
        }
        self.shared.metrics.record_attempt(Method::Direct);
        if config.sample_loss(&mut rng) {
            debug!(msg_id = %message.id(), target, "direct lost");
            return self.fail(&message, FailureReason::SimulatedLoss).await;
        }

        // Emit to the target
        let event = Event::Message(Delivered::direct(&message));
        match self.emit(&Route::node(target), &event).await {
            Ok(_) => {}
            Err(Error::ShuttingDown) => {
                debug!(msg_id = %message.id(), "direct cancelled");
                return Outcome::Cancelled;
            }
            Err(err) => {
                warn!(msg_id = %message.id(), target, ?err, "direct emission failed");
                return self.fail(&message, FailureReason::TransportFailure).await;
            }
        }
        let elapsed = message.elapsed();
        self.shared.metrics.record_delivered(Method::Direct, elapsed);
        debug!(msg_id = %message.id(), target, ?elapsed, "direct delivered");
        Outcome::Delivered {
            attempts: 1,
            latency: elapsed,
        }
    }

    /// Record a lost Direct message and notify its sender.
    async fn fail(&self, message: &Message, reason: FailureReason) -> Outcome {
        self.shared.metrics.record_lost(Method::Direct);
        let notice = Event::DeliveryFailed {
            msg_id: message.id(),
            method: Method::Direct,
            reason,
        };
        if let Err(err) = self.emit(&Route::node(message.sender()), &notice).await {
            warn!(msg_id = %message.id(), ?err, "failed to notify sender");
        }
        Outcome::Lost { attempts: 1 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::ConfigUpdate, engine::Config, SimulationConfig};
    use courier_transport::memory::Bus;
    use futures::StreamExt;
    use prometheus_client::registry::Registry;
    use std::time::Duration;

    fn engine(bus: Bus, loss_rate: i64) -> Engine<Bus> {
        let cfg = Config {
            simulation: SimulationConfig::default().apply(&ConfigUpdate {
                loss_rate: Some(loss_rate),
                latency_min: Some(20),
                latency_max: Some(40),
                ..ConfigUpdate::default()
            }),
            ..Config::default()
        };
        Engine::new(bus, &mut Registry::default(), cfg)
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivered_after_latency() {
        let bus = Bus::new();
        let engine = engine(bus.clone(), 0);
        let mut inbox = bus.subscribe(&Route::node("B")).await.unwrap();

        let handle = engine
            .submit("A", Some("B".into()), Method::Direct, "hello")
            .unwrap();
        let outcomes = handle.wait().await;
        let Outcome::Delivered { attempts, latency } = outcomes[0].outcome else {
            panic!("unexpected outcome: {:?}", outcomes[0]);
        };
        assert_eq!(attempts, 1);
        assert!(latency >= Duration::from_millis(20) && latency <= Duration::from_millis(40));

        let Event::Message(delivered) = Event::decode(&inbox.next().await.unwrap()).unwrap()
        else {
            panic!("unexpected event");
        };
        assert_eq!(delivered.from, "A");
        assert_eq!(delivered.to.as_deref(), Some("B"));
        assert_eq!(delivered.content, "hello");
        assert_eq!(delivered.attempt, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_notifies_sender() {
        let bus = Bus::new();
        let engine = engine(bus.clone(), 100);
        let mut sender = bus.subscribe(&Route::node("A")).await.unwrap();
        let target = bus.subscribe(&Route::node("B")).await.unwrap();

        let handle = engine
            .submit("A", Some("B".into()), Method::Direct, "hello")
            .unwrap();
        let id = handle.message();
        assert_eq!(handle.wait().await[0].outcome, Outcome::Lost { attempts: 1 });
        assert_eq!(
            Event::decode(&sender.next().await.unwrap()).unwrap(),
            Event::DeliveryFailed {
                msg_id: id,
                method: Method::Direct,
                reason: FailureReason::SimulatedLoss,
            }
        );
        drop(target);
        assert_eq!(engine.snapshot().get(Method::Direct).lost, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failure_counted_lost() {
        let bus = Bus::new();
        let engine = engine(bus.clone(), 0);
        let handle = engine
            .submit("A", Some("B".into()), Method::Direct, "hello")
            .unwrap();
        bus.close();

        assert_eq!(handle.wait().await[0].outcome, Outcome::Lost { attempts: 1 });
        let snapshot = engine.snapshot().get(Method::Direct);
        assert_eq!(snapshot.lost, 1);
        assert_eq!(snapshot.delivered, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_during_latency() {
        let engine = engine(Bus::new(), 0);
        let handle = engine
            .submit("A", Some("B".into()), Method::Direct, "hello")
            .unwrap();
        engine.shutdown().await;

        assert_eq!(handle.wait().await[0].outcome, Outcome::Cancelled);
        let snapshot = engine.snapshot().get(Method::Direct);
        assert_eq!(snapshot.delivered + snapshot.lost, 0);
    }
}
