//! Simulation parameters and the [ConfigStore] that owns them.
//!
//! Every field of [SimulationConfig] is clamped to its domain on write. Invalid input is
//! corrected, never rejected, so a misconfigured simulation degrades gracefully.

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize};
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::debug;

/// Lowest accepted ack timeout (in milliseconds).
pub const MIN_ACK_TIMEOUT_MS: u64 = 100;

/// Parameters of the simulated network.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ConfigUpdate")]
pub struct SimulationConfig {
    #[serde(rename = "loss_rate")]
    loss_rate_percent: u8,
    #[serde(rename = "latency_min")]
    latency_min_ms: u64,
    #[serde(rename = "latency_max")]
    latency_max_ms: u64,
    max_retries: u32,
    #[serde(rename = "ack_timeout")]
    ack_timeout_ms: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            loss_rate_percent: 10,
            latency_min_ms: 50,
            latency_max_ms: 250,
            max_retries: 2,
            ack_timeout_ms: 600,
        }
    }
}

impl SimulationConfig {
    /// Probability (in percent) that a Direct message is lost.
    pub fn loss_rate_percent(&self) -> u8 {
        self.loss_rate_percent
    }

    pub fn latency_min_ms(&self) -> u64 {
        self.latency_min_ms
    }

    pub fn latency_max_ms(&self) -> u64 {
        self.latency_max_ms
    }

    /// Number of retries after the first PubSub attempt.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn ack_timeout_ms(&self) -> u64 {
        self.ack_timeout_ms
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Apply the present fields of `update`, clamping each one to its domain.
    pub fn apply(mut self, update: &ConfigUpdate) -> Self {
        if let Some(loss_rate) = update.loss_rate {
            self.loss_rate_percent = loss_rate.clamp(0, 100) as u8;
        }
        if let Some(latency_min) = update.latency_min {
            self.latency_min_ms = latency_min.max(0) as u64;
        }
        if let Some(latency_max) = update.latency_max {
            self.latency_max_ms = latency_max.max(0) as u64;
        }

        // A new minimum may exceed the stored maximum (or the update may invert them)
        self.latency_max_ms = self.latency_max_ms.max(self.latency_min_ms);
        if let Some(max_retries) = update.max_retries {
            self.max_retries = max_retries.clamp(0, u32::MAX as i64) as u32;
        }
        if let Some(ack_timeout) = update.ack_timeout {
            self.ack_timeout_ms = ack_timeout.max(MIN_ACK_TIMEOUT_MS as i64) as u64;
        }
        self
    }

    /// Draw a latency uniformly from `[latency_min, latency_max]`.
    pub fn sample_latency<R: Rng>(&self, rng: &mut R) -> Duration {
        Duration::from_millis(rng.gen_range(self.latency_min_ms..=self.latency_max_ms))
    }

    /// Draw whether a message is lost (with probability `loss_rate / 100`).
    pub fn sample_loss<R: Rng>(&self, rng: &mut R) -> bool {
        rng.gen_bool(f64::from(self.loss_rate_percent.min(100)) / 100.0)
    }
}

/// A partial update of a [SimulationConfig].
///
/// Fields are signed so out-of-range input (e.g. a negative latency) can be represented and
/// clamped instead of rejected. Any number is accepted when deserializing: fractions are
/// truncated toward zero and magnitudes beyond `i64` saturate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigUpdate {
    #[serde(
        skip_serializing_if = "Option::is_none",
        deserialize_with = "saturating"
    )]
    pub loss_rate: Option<i64>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        deserialize_with = "saturating"
    )]
    pub latency_min: Option<i64>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        deserialize_with = "saturating"
    )]
    pub latency_max: Option<i64>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        deserialize_with = "saturating"
    )]
    pub max_retries: Option<i64>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        deserialize_with = "saturating"
    )]
    pub ack_timeout: Option<i64>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Number {
    Signed(i64),
    Unsigned(u64),
    Float(f64),
}

impl Number {
    fn saturate(self) -> i64 {
        match self {
            Self::Signed(value) => value,
            Self::Unsigned(value) => i64::try_from(value).unwrap_or(i64::MAX),
            // `as` truncates, saturates at the bounds and maps NaN to zero
            Self::Float(value) => value as i64,
        }
    }
}

fn saturating<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    Ok(Option::<Number>::deserialize(deserializer)?.map(Number::saturate))
}

impl From<ConfigUpdate> for SimulationConfig {
    fn from(update: ConfigUpdate) -> Self {
        Self::default().apply(&update)
    }
}

/// Owner of the current [SimulationConfig].
///
/// Readers always observe a complete config (never a partially applied update) and observers
/// are notified of every change.
#[derive(Clone)]
pub struct ConfigStore {
    sender: Arc<watch::Sender<SimulationConfig>>,
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new(SimulationConfig::default())
    }
}

impl ConfigStore {
    pub fn new(initial: SimulationConfig) -> Self {
        let (sender, _) = watch::channel(initial);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Atomic snapshot of the current config.
    pub fn get(&self) -> SimulationConfig {
        *self.sender.borrow()
    }

    /// Apply `update` and return the resulting config.
    ///
    /// Never fails: every present field is clamped to its domain.
    pub fn update(&self, update: &ConfigUpdate) -> SimulationConfig {
        let mut updated = SimulationConfig::default();
        self.sender.send_modify(|config| {
            *config = config.apply(update);
            updated = *config;
        });
        debug!(config = ?updated, "config updated");
        updated
    }

    /// Follow config changes.
    ///
    /// The returned receiver has already seen the current config; intermediate values may be
    /// coalesced when updates arrive faster than they are observed.
    pub fn subscribe(&self) -> watch::Receiver<SimulationConfig> {
        self.sender.subscribe()
    }
}
