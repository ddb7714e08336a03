//! Recover from transient failures of a primary [Transport].
//!
//! # Design
//!
//! Every `publish` and `subscribe` is first attempted on the primary transport. Failed attempts
//! are retried up to [Config::max_retries] times, sleeping between attempts for an exponentially
//! increasing backoff (starting at [Config::backoff_base], doubling, capped at
//! [Config::backoff_max]). If every retry fails, the operation is degraded to the fallback
//! transport (typically an in-process [crate::memory::Bus]) so that a payload is never silently
//! dropped. Each degradation is logged at `warn` and counted.
//!
//! Inbound streams follow both transports at once: payloads degraded to the fallback still reach
//! subscribers that joined while the primary was healthy. When the primary stream ends (a
//! disconnect), it is re-established with the same retry schedule. If the primary stays down,
//! the stream continues on the fallback alone.

use crate::{Error, Inbound, Route, Transport};
use bytes::Bytes;
use futures::{stream, StreamExt};
use prometheus_client::{metrics::counter::Counter, registry::Registry};
use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for [Resilient].
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Number of retries on the primary before degrading to the fallback.
    pub max_retries: u32,

    /// Backoff applied after the first failure.
    pub backoff_base: Duration,

    /// Upper bound on any single backoff.
    pub backoff_max: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_millis(50),
            backoff_max: Duration::from_secs(1),
        }
    }
}

impl Config {
    /// Backoff to wait after the failure of (zero-indexed) `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.backoff_base
            .saturating_mul(factor)
            .min(self.backoff_max)
    }
}

/// Metrics for [Resilient].
#[derive(Clone, Default)]
pub struct Metrics {
    /// Number of retries against the primary transport.
    pub retries: Counter,
    /// Number of operations served by the fallback transport.
    pub degraded: Counter,
}

impl Metrics {
    /// Create and return a new set of metrics, registered with the given registry.
    pub fn init(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register(
            "transport_retries",
            "Number of retries against the primary transport",
            metrics.retries.clone(),
        );
        registry.register(
            "transport_degraded",
            "Number of operations served by the fallback transport",
            metrics.degraded.clone(),
        );
        metrics
    }
}

/// A [Transport] that retries a primary and degrades to a fallback.
#[derive(Clone)]
pub struct Resilient<P, F> {
    primary: P,
    fallback: F,
    cfg: Config,
    metrics: Metrics,
}

impl<P: Transport, F: Transport> Resilient<P, F> {
    /// Wrap `primary`, degrading to `fallback` once retries are exhausted.
    pub fn new(primary: P, fallback: F, cfg: Config, metrics: Metrics) -> Self {
        Self {
            primary,
            fallback,
            cfg,
            metrics,
        }
    }

    /// Returns the metrics tracked by this transport.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Follow `inbound` from the primary, re-subscribing whenever it ends.
    ///
    /// The returned stream ends once the primary cannot be re-subscribed within the retry budget.
    fn follow(&self, route: &Route, inbound: Inbound) -> Inbound {
        let state = (
            self.primary.clone(),
            route.clone(),
            self.cfg,
            self.metrics.clone(),
            inbound,
        );
        Box::pin(stream::unfold(
            state,
            |(primary, route, cfg, metrics, mut inbound)| async move {
                loop {
                    if let Some(payload) = inbound.next().await {
                        return Some((payload, (primary, route, cfg, metrics, inbound)));
                    }
                    debug!(%route, "primary stream ended, resubscribing");
                    inbound = match subscribe_primary(&primary, &route, &cfg, &metrics).await {
                        Ok(inbound) => inbound,
                        Err(err) => {
                            warn!(%route, ?err, "primary lost, following fallback only");
                            metrics.degraded.inc();
                            return None;
                        }
                    };
                }
            },
        ))
    }
}

impl<P: Transport, F: Transport> Transport for Resilient<P, F> {
    async fn publish(&self, route: &Route, payload: Bytes) -> Result<usize, Error> {
        let mut attempt = 0;
        loop {
            let err = match self.primary.publish(route, payload.clone()).await {
                Ok(reached) => return Ok(reached),
                Err(err) => err,
            };
            if attempt >= self.cfg.max_retries {
                warn!(%route, ?err, attempts = attempt + 1, "primary exhausted, publishing to fallback");
                self.metrics.degraded.inc();
                return self.fallback.publish(route, payload).await;
            }
            let backoff = self.cfg.backoff(attempt);
            debug!(%route, ?err, attempt, ?backoff, "publish failed, retrying");
            self.metrics.retries.inc();
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }

    async fn subscribe(&self, route: &Route) -> Result<Inbound, Error> {
        let primary = match subscribe_primary(&self.primary, route, &self.cfg, &self.metrics).await
        {
            Ok(inbound) => Some(inbound),
            Err(err) => {
                warn!(%route, ?err, "primary exhausted, subscribing to fallback");
                self.metrics.degraded.inc();
                None
            }
        };
        let fallback = self.fallback.subscribe(route).await;
        let Some(primary) = primary else {
            return fallback;
        };
        let primary = self.follow(route, primary);
        match fallback {
            Ok(fallback) => Ok(Box::pin(stream::select(primary, fallback))),
            Err(err) => {
                warn!(%route, ?err, "fallback unavailable, following primary only");
                Ok(primary)
            }
        }
    }
}

/// Subscribe to `route` on `primary`, retrying with backoff.
///
/// Returns the last error once [Config::max_retries] retries have failed.
async fn subscribe_primary<P: Transport>(
    primary: &P,
    route: &Route,
    cfg: &Config,
    metrics: &Metrics,
) -> Result<Inbound, Error> {
    let mut attempt = 0;
    loop {
        let err = match primary.subscribe(route).await {
            Ok(inbound) => return Ok(inbound),
            Err(err) => err,
        };
        if attempt >= cfg.max_retries {
            return Err(err);
        }
        let backoff = cfg.backoff(attempt);
        debug!(%route, ?err, attempt, ?backoff, "subscribe failed, retrying");
        metrics.retries.inc();
        tokio::time::sleep(backoff).await;
        attempt += 1;
    }
}
