//! Simulated recipients.

use courier_delivery::{
    wire::{Ack, Event, ACKS_TOPIC},
    Engine, Error,
};
use courier_transport::{Route, Transport};
use futures::StreamExt;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::{select, task::JoinHandle};
use tracing::{debug, info, warn};

/// A node that follows its inbox and acknowledges PubSub attempts with some probability.
pub struct Node<T: Transport> {
    id: String,
    ack_probability: f64,
    engine: Engine<T>,
}

impl<T: Transport> Node<T> {
    /// Create a node acknowledging with `ack_probability`, clamped to `[0, 1]`.
    ///
    /// A NaN probability falls back to always acknowledging.
    pub fn new(id: impl Into<String>, ack_probability: f64, engine: Engine<T>) -> Self {
        let id = id.into();
        let ack_probability = if ack_probability.is_nan() {
            warn!(node = %id, "ack probability is NaN, acknowledging every attempt");
            1.0
        } else {
            ack_probability.clamp(0.0, 1.0)
        };
        Self {
            id,
            ack_probability,
            engine,
        }
    }

    /// Subscribe the node (to its inbox and to PubSub messages) and start handling its traffic.
    ///
    /// The node leaves once the engine shuts down.
    pub async fn start(self) -> Result<JoinHandle<()>, Error> {
        let mut inbox = self
            .engine
            .transport()
            .subscribe(&Route::node(self.id.as_str()))
            .await?;
        self.engine.join(self.id.as_str());
        info!(node = %self.id, ack_probability = self.ack_probability, "node started");

        let cancel = self.engine.cancellation();
        Ok(tokio::spawn(async move {
            let mut rng = StdRng::from_entropy();
            loop {
                select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    payload = inbox.next() => {
                        let Some(payload) = payload else {
                            break;
                        };
                        self.handle(&payload, &mut rng).await;
                    },
                }
            }
            self.engine.leave(&self.id);
            debug!(node = %self.id, "node stopped");
        }))
    }

    async fn handle(&self, payload: &[u8], rng: &mut StdRng) {
        let event = match Event::decode(payload) {
            Ok(event) => event,
            Err(err) => {
                warn!(node = %self.id, ?err, "dropping malformed payload");
                return;
            }
        };
        match event {
            Event::Message(delivered) => {
                info!(node = %self.id, msg_id = %delivered.msg_id, from = %delivered.from, "received direct");
            }
            Event::PubsubMessage(delivered) => {
                if !rng.gen_bool(self.ack_probability) {
                    debug!(node = %self.id, msg_id = %delivered.msg_id, attempt = ?delivered.attempt, "withholding ack");
                    return;
                }
                let result = match Ack::new(delivered.msg_id, self.id.as_str()).encode() {
                    Ok(ack) => self
                        .engine
                        .transport()
                        .publish(&Route::topic(ACKS_TOPIC), ack)
                        .await
                        .map_err(Error::from),
                    Err(err) => Err(err),
                };
                if let Err(err) = result {
                    warn!(node = %self.id, msg_id = %delivered.msg_id, ?err, "failed to ack");
                }
            }
            Event::DeliveryFailed { msg_id, reason, .. } => {
                info!(node = %self.id, %msg_id, ?reason, "delivery failed");
            }
            other => debug!(node = %self.id, ?other, "ignoring event"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_delivery::{AckListener, Config, ConfigUpdate, Method, Outcome, SimulationConfig};
    use courier_transport::memory::Bus;
    use prometheus_client::registry::Registry;

    fn engine(max_retries: i64) -> Engine<Bus> {
        let cfg = Config {
            simulation: SimulationConfig::default().apply(&ConfigUpdate {
                latency_min: Some(5),
                latency_max: Some(10),
                max_retries: Some(max_retries),
                ..ConfigUpdate::default()
            }),
            ..Config::default()
        };
        Engine::new(Bus::new(), &mut Registry::default(), cfg)
    }

    #[tokio::test(start_paused = true)]
    async fn test_node_acks_attempts() {
        let engine = engine(2);
        AckListener::new(engine.clone(), &mut Registry::default())
            .start()
            .await
            .unwrap();
        Node::new("alice", 1.0, engine.clone()).start().await.unwrap();
        assert!(engine.subscribers().contains("alice"));

        let handle = engine.submit("bob", None, Method::PubSub, "hi").unwrap();
        let outcomes = handle.wait().await;
        assert!(matches!(
            outcomes[0].outcome,
            Outcome::Delivered { attempts: 1, .. }
        ));
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_node_withholds_acks() {
        let engine = engine(1);
        AckListener::new(engine.clone(), &mut Registry::default())
            .start()
            .await
            .unwrap();
        Node::new("alice", 0.0, engine.clone()).start().await.unwrap();

        let handle = engine.submit("bob", None, Method::PubSub, "hi").unwrap();
        assert_eq!(
            handle.wait().await[0].outcome,
            Outcome::Lost { attempts: 2 }
        );
        engine.shutdown().await;
    }

    #[test]
    fn test_ack_probability_sanitized() {
        let engine = engine(0);
        assert_eq!(Node::new("a", f64::NAN, engine.clone()).ack_probability, 1.0);
        assert_eq!(Node::new("b", f64::INFINITY, engine.clone()).ack_probability, 1.0);
        assert_eq!(Node::new("c", -0.5, engine.clone()).ack_probability, 0.0);
        assert_eq!(Node::new("d", 0.25, engine).ack_probability, 0.25);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nan_probability_from_yaml_acks() {
        let config: crate::Config =
            serde_yaml::from_str("nodes:\n  - id: alice\n    ack_probability: .nan\n").unwrap();
        assert!(config.nodes[0].ack_probability.is_nan());

        let engine = engine(1);
        AckListener::new(engine.clone(), &mut Registry::default())
            .start()
            .await
            .unwrap();
        let node = &config.nodes[0];
        Node::new(node.id.as_str(), node.ack_probability, engine.clone())
            .start()
            .await
            .unwrap();

        let handle = engine.submit("bob", None, Method::PubSub, "hi").unwrap();
        assert!(matches!(
            handle.wait().await[0].outcome,
            Outcome::Delivered { attempts: 1, .. }
        ));
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_node_leaves_on_shutdown() {
        let engine = engine(0);
        let node = Node::new("alice", 1.0, engine.clone()).start().await.unwrap();
        engine.shutdown().await;
        node.await.unwrap();
        assert!(!engine.subscribers().contains("alice"));
    }
}
