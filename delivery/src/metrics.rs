//! Per-method delivery counters and latency samples.

use crate::types::Method;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, histogram::Histogram},
    registry::Registry,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, VecDeque},
    sync::Mutex,
    time::Duration,
};

/// Default number of recent latency samples retained per method.
pub const DEFAULT_RETENTION: usize = 1024;

/// Histogram buckets (in seconds) for end-to-end latency.
///
/// Deliveries may require multiple attempts (each bounded by the ack timeout).
const LATENCY_BUCKETS: [f64; 13] = [
    0.010, 0.020, 0.050, 0.100, 0.200, 0.500, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 300.0,
];

/// Label for per-method metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct MethodLabel {
    pub method: Method,
}

impl From<Method> for MethodLabel {
    fn from(method: Method) -> Self {
        Self { method }
    }
}

fn latency_histogram() -> Histogram {
    Histogram::new(LATENCY_BUCKETS.into_iter())
}

/// Latency samples with an exact running mean and bounded retention.
struct Samples {
    count: u64,
    sum: f64,
    recent: VecDeque<f64>,
    retention: usize,
}

impl Samples {
    fn new(retention: usize) -> Self {
        Self {
            count: 0,
            sum: 0.0,
            recent: VecDeque::with_capacity(retention.min(DEFAULT_RETENTION)),
            retention,
        }
    }

    fn push(&mut self, seconds: f64) {
        self.count += 1;
        self.sum += seconds;
        if self.retention == 0 {
            return;
        }
        if self.recent.len() == self.retention {
            self.recent.pop_front();
        }
        self.recent.push_back(seconds);
    }

    fn mean(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum / self.count as f64
    }
}

struct Counters {
    sent: u64,
    delivered: u64,
    lost: u64,
    latency: Samples,
}

impl Counters {
    fn new(retention: usize) -> Self {
        Self {
            sent: 0,
            delivered: 0,
            lost: 0,
            latency: Samples::new(retention),
        }
    }
}

/// Summary of a single method at snapshot time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MethodSnapshot {
    pub sent: u64,
    pub delivered: u64,
    pub lost: u64,
    /// Mean end-to-end latency in seconds, rounded to 3 decimal places.
    #[serde(rename = "avg_latency")]
    pub mean_latency: f64,
}

/// Summary of every method at snapshot time.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot(BTreeMap<Method, MethodSnapshot>);

impl Snapshot {
    /// Returns the summary for `method` (zeroed if nothing was recorded).
    pub fn get(&self, method: Method) -> MethodSnapshot {
        self.0.get(&method).copied().unwrap_or_default()
    }
}

/// Aggregates delivery outcomes across all concurrent delivery tasks.
///
/// Every outcome is also exported to a [Registry] (if registered via [MetricsAggregator::init]).
pub struct MetricsAggregator {
    counters: Mutex<[Counters; 2]>,

    /// Number of messages submitted per method
    sent: Family<MethodLabel, Counter>,
    /// Number of terminal deliveries per method
    delivered: Family<MethodLabel, Counter>,
    /// Number of terminal losses per method
    lost: Family<MethodLabel, Counter>,
    /// Number of transmission attempts per method
    attempts: Family<MethodLabel, Counter>,
    /// End-to-end latency of deliveries per method
    latency: Family<MethodLabel, Histogram, fn() -> Histogram>,
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION)
    }
}

impl MetricsAggregator {
    /// Create an aggregator retaining the `retention` most recent latency samples per method.
    pub fn new(retention: usize) -> Self {
        Self {
            counters: Mutex::new([Counters::new(retention), Counters::new(retention)]),
            sent: Family::default(),
            delivered: Family::default(),
            lost: Family::default(),
            attempts: Family::default(),
            latency: Family::new_with_constructor(latency_histogram),
        }
    }

    /// Create and return a new aggregator, registered with the given registry.
    pub fn init(registry: &mut Registry, retention: usize) -> Self {
        let metrics = Self::new(retention);
        registry.register(
            "sent",
            "Number of messages submitted per method",
            metrics.sent.clone(),
        );
        registry.register(
            "delivered",
            "Number of terminal deliveries per method",
            metrics.delivered.clone(),
        );
        registry.register(
            "lost",
            "Number of terminal losses per method",
            metrics.lost.clone(),
        );
        registry.register(
            "attempts",
            "Number of transmission attempts per method",
            metrics.attempts.clone(),
        );
        registry.register(
            "latency",
            "End-to-end latency of deliveries per method",
            metrics.latency.clone(),
        );
        metrics
    }

    pub fn record_sent(&self, method: Method) {
        self.counters.lock().unwrap()[method.index()].sent += 1;
        self.sent.get_or_create(&method.into()).inc();
    }

    pub fn record_delivered(&self, method: Method, latency: Duration) {
        let seconds = latency.as_secs_f64();
        {
            let mut counters = self.counters.lock().unwrap();
            let counters = &mut counters[method.index()];
            counters.delivered += 1;
            counters.latency.push(seconds);
        }
        self.delivered.get_or_create(&method.into()).inc();
        self.latency.get_or_create(&method.into()).observe(seconds);
    }

    pub fn record_lost(&self, method: Method) {
        self.counters.lock().unwrap()[method.index()].lost += 1;
        self.lost.get_or_create(&method.into()).inc();
    }

    pub fn record_attempt(&self, method: Method) {
        self.attempts.get_or_create(&method.into()).inc();
    }

    /// Number of transmission attempts recorded for `method`.
    pub fn attempts(&self, method: Method) -> u64 {
        self.attempts.get_or_create(&method.into()).get()
    }

    /// The most recent latency samples (in seconds) for `method`, oldest first.
    pub fn recent_latencies(&self, method: Method) -> Vec<f64> {
        let counters = self.counters.lock().unwrap();
        counters[method.index()].latency.recent.iter().copied().collect()
    }

    /// Summarize every method.
    ///
    /// The mean latency covers every sample ever recorded (not just the retained ones) and is
    /// `0` when nothing was delivered.
    pub fn snapshot(&self) -> Snapshot {
        let counters = self.counters.lock().unwrap();
        let summaries = Method::ALL
            .into_iter()
            .map(|method| {
                let counters = &counters[method.index()];
                let summary = MethodSnapshot {
                    sent: counters.sent,
                    delivered: counters.delivered,
                    lost: counters.lost,
                    mean_latency: (counters.latency.mean() * 1000.0).round() / 1000.0,
                };
                (method, summary)
            })
            .collect();
        Snapshot(summaries)
    }
}
