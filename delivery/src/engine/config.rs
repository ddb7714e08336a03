use crate::{config::SimulationConfig, ledger, metrics};
use std::time::Duration;

/// Configuration for the [super::Engine].
#[derive(Clone, Debug)]
pub struct Config {
    /// Initial parameters of the simulated network.
    pub simulation: SimulationConfig,

    /// Maximum number of delivery units (a Direct message or a single PubSub recipient) running
    /// at once. Additional units wait for a slot.
    pub max_in_flight: usize,

    /// How long an acknowledgment is retained before it can be evicted.
    pub ledger_ttl: Duration,

    /// How often the ack ledger is pruned.
    pub prune_interval: Duration,

    /// Number of recent latency samples retained per method.
    pub latency_retention: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            simulation: SimulationConfig::default(),
            max_in_flight: 4096,
            ledger_ttl: ledger::DEFAULT_TTL,
            prune_interval: Duration::from_secs(30),
            latency_retention: metrics::DEFAULT_RETENTION,
        }
    }
}
