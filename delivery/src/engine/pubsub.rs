use super::{Engine, Outcome};
use crate::{
    types::{Message, Method, NodeId},
    wire::{Delivered, Event},
    Error,
};
use courier_transport::{Route, Transport};
use rand::{rngs::StdRng, SeedableRng};
use std::{sync::Arc, time::Duration};
use tokio::{select, time::timeout};
use tracing::{debug, trace, warn};

/// Retry budget of a PubSub message, fixed at publish time.
#[derive(Clone, Copy, Debug)]
pub(super) struct Budget {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// How long each attempt waits for an acknowledgment.
    pub ack_timeout: Duration,
}

impl<T: Transport> Engine<T> {
    /// Deliver a PubSub message to `recipient`, retrying until it is acknowledged or `budget` is
    /// exhausted.
    ///
    /// Attempts are strictly sequential and numbered from 1.
    pub(super) async fn deliver_pubsub(
        self,
        message: Arc<Message>,
        recipient: NodeId,
        budget: Budget,
    ) -> Outcome {
        let Some(_permit) = self.acquire().await else {
            return Outcome::Cancelled;
        };
        let id = message.id();
        let route = Route::node(recipient.as_str());
        let mut rng = StdRng::from_entropy();
        let mut attempt = 1;
        loop {
            // Latency bounds may change between attempts
            let latency = self.shared.config.get().sample_latency(&mut rng);
            if !self.pause(latency).await {
                debug!(msg_id = %id, recipient, attempt, "pubsub cancelled");
                return Outcome::Cancelled;
            }

            // Register interest before emitting so an immediate ack resolves the wait
            let waiter = self.shared.ledger.wait(id, &recipient);
            self.shared.metrics.record_attempt(Method::PubSub);
            let event = Event::PubsubMessage(Delivered::pubsub(&message, &recipient, attempt));
            match self.emit(&route, &event).await {
                Ok(reached) => trace!(msg_id = %id, recipient, attempt, reached, "attempt sent"),
                Err(Error::ShuttingDown) => {
                    debug!(msg_id = %id, recipient, attempt, "pubsub cancelled");
                    return Outcome::Cancelled;
                }
                Err(err) => warn!(msg_id = %id, recipient, attempt, ?err, "attempt failed"),
            }

            // Wait for the acknowledgment
            let acked = select! {
                biased;
                _ = self.shared.cancel.cancelled() => {
                    debug!(msg_id = %id, recipient, attempt, "pubsub cancelled");
                    return Outcome::Cancelled;
                },
                result = timeout(budget.ack_timeout, waiter) => matches!(result, Ok(true)),
            };
            if acked {
                let elapsed = message.elapsed();
                self.shared.metrics.record_delivered(Method::PubSub, elapsed);
                debug!(msg_id = %id, recipient, attempt, ?elapsed, "pubsub delivered");
                return Outcome::Delivered {
                    attempts: attempt,
                    latency: elapsed,
                };
            }
            if attempt > budget.max_retries {
                self.shared.metrics.record_lost(Method::PubSub);
                debug!(msg_id = %id, recipient, attempts = attempt, "pubsub exhausted");
                return Outcome::Lost { attempts: attempt };
            }
            trace!(msg_id = %id, recipient, attempt, "ack timeout, retrying");
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::ConfigUpdate, engine::Config, SimulationConfig};
    use courier_transport::memory::Bus;
    use futures::StreamExt;
    use prometheus_client::registry::Registry;
    use test_case::test_case;

    fn engine(bus: Bus, max_retries: i64) -> Engine<Bus> {
        let cfg = Config {
            simulation: SimulationConfig::default().apply(&ConfigUpdate {
                loss_rate: Some(100),
                latency_min: Some(10),
                latency_max: Some(10),
                max_retries: Some(max_retries),
                ack_timeout: Some(200),
            }),
            ..Config::default()
        };
        Engine::new(bus, &mut Registry::default(), cfg)
    }

    #[test_case(0; "no retries")]
    #[test_case(2; "default retries")]
    #[test_case(5; "many retries")]
    #[tokio::test(start_paused = true)]
    async fn test_exhausted_without_acks(max_retries: u32) {
        let bus = Bus::new();
        let engine = engine(bus.clone(), max_retries as i64);
        engine.join("B");
        let mut inbox = bus.subscribe(&Route::node("B")).await.unwrap();

        let handle = engine.submit("A", None, Method::PubSub, "hello").unwrap();
        let outcomes = handle.wait().await;
        assert_eq!(
            outcomes[0].outcome,
            Outcome::Lost {
                attempts: max_retries + 1
            }
        );
        for expected in 1..=max_retries + 1 {
            let Event::PubsubMessage(delivered) =
                Event::decode(&inbox.next().await.unwrap()).unwrap()
            else {
                panic!("unexpected event");
            };
            assert_eq!(delivered.attempt, Some(expected));
        }
        assert_eq!(engine.metrics().attempts(Method::PubSub), (max_retries + 1) as u64);
        assert_eq!(engine.snapshot().get(Method::PubSub).lost, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_stops_retries() {
        let bus = Bus::new();
        let engine = engine(bus.clone(), 5);
        engine.join("B");
        let mut inbox = bus.subscribe(&Route::node("B")).await.unwrap();

        let handle = engine.submit("A", None, Method::PubSub, "hello").unwrap();
        let id = handle.message();

        // Ack the second attempt (twice)
        inbox.next().await.unwrap();
        inbox.next().await.unwrap();
        assert!(engine.record_ack(id, "B"));
        assert!(!engine.record_ack(id, "B"));

        let outcomes = handle.wait().await;
        assert!(matches!(
            outcomes[0].outcome,
            Outcome::Delivered { attempts: 2, .. }
        ));
        let snapshot = engine.snapshot().get(Method::PubSub);
        assert_eq!(snapshot.delivered, 1);
        assert_eq!(snapshot.lost, 0);
        assert_eq!(engine.metrics().attempts(Method::PubSub), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_fixed_at_publish() {
        let engine = engine(Bus::new(), 1);
        engine.join("B");
        let handle = engine.submit("A", None, Method::PubSub, "hello").unwrap();
        engine.update_config(&ConfigUpdate {
            max_retries: Some(10),
            ..ConfigUpdate::default()
        });
        assert_eq!(
            handle.wait().await[0].outcome,
            Outcome::Lost { attempts: 2 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failure_is_unacked() {
        let bus = Bus::new();
        let engine = engine(bus.clone(), 1);
        engine.join("B");
        let handle = engine.submit("A", None, Method::PubSub, "hello").unwrap();
        bus.close();

        assert_eq!(
            handle.wait().await[0].outcome,
            Outcome::Lost { attempts: 2 }
        );
    }
}
