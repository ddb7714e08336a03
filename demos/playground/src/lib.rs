//! Compare Direct and PubSub delivery over a simulated unreliable network.
//!
//! The playground wires a [courier_delivery::Engine] to an in-process transport, spawns a set of
//! simulated [node::Node]s that acknowledge PubSub attempts with a configurable probability, and
//! exposes everything over HTTP:
//!
//! | Route                   | Description                                       |
//! |-------------------------|---------------------------------------------------|
//! | `POST /messages`        | Submit `{from, to?, method, content}`             |
//! | `POST /acks`            | Report `{msg_id, node}` for a PubSub attempt      |
//! | `GET /config`           | Current simulation config                         |
//! | `POST /config`          | Partial update (every field is clamped)           |
//! | `PUT /nodes/{id}`       | Subscribe a node to PubSub messages               |
//! | `DELETE /nodes/{id}`    | Unsubscribe a node                                |
//! | `GET /snapshot`         | Per-method summary                                |
//! | `GET /metrics`          | Prometheus exposition                             |
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin playground -- --config demos/playground/config.yaml --log-level debug
//! ```

use courier_delivery::ConfigUpdate;
use courier_transport::resilient;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod api;
pub mod node;
pub mod telemetry;

/// Configuration for the playground (loaded from YAML).
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Initial simulation parameters (clamped like any other update).
    pub simulation: ConfigUpdate,
    pub engine: EngineConfig,
    pub transport: TransportConfig,
    /// Simulated nodes subscribed at startup.
    pub nodes: Vec<NodeConfig>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_in_flight: usize,
    pub broadcast_interval_ms: u64,
    pub ledger_ttl_secs: u64,
    pub latency_retention: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let defaults = courier_delivery::Config::default();
        Self {
            max_in_flight: defaults.max_in_flight,
            broadcast_interval_ms: courier_delivery::broadcaster::DEFAULT_INTERVAL.as_millis()
                as u64,
            ledger_ttl_secs: defaults.ledger_ttl.as_secs(),
            latency_retention: defaults.latency_retention,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        let defaults = resilient::Config::default();
        Self {
            max_retries: defaults.max_retries,
            backoff_base_ms: defaults.backoff_base.as_millis() as u64,
            backoff_max_ms: defaults.backoff_max.as_millis() as u64,
        }
    }
}

/// A simulated recipient.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct NodeConfig {
    pub id: String,
    /// Probability (in `[0, 1]`) that the node acknowledges a PubSub attempt.
    #[serde(default = "default_ack_probability")]
    pub ack_probability: f64,
}

fn default_ack_probability() -> f64 {
    1.0
}

impl Config {
    /// Configuration of the delivery engine.
    pub fn engine(&self) -> courier_delivery::Config {
        courier_delivery::Config {
            simulation: courier_delivery::SimulationConfig::from(self.simulation),
            max_in_flight: self.engine.max_in_flight,
            ledger_ttl: Duration::from_secs(self.engine.ledger_ttl_secs),
            latency_retention: self.engine.latency_retention,
            ..courier_delivery::Config::default()
        }
    }

    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.engine.broadcast_interval_ms)
    }

    /// Configuration of the resilient transport.
    pub fn transport(&self) -> resilient::Config {
        resilient::Config {
            max_retries: self.transport.max_retries,
            backoff_base: Duration::from_millis(self.transport.backoff_base_ms),
            backoff_max: Duration::from_millis(self.transport.backoff_max_ms),
        }
    }
}
