//! Metrics Collector

use anyhow::Context;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

use super::MetricsSnapshot;
use crate::relay::{CloseReason, Direction, RelaySession};
use crate::Result;

/// Relay counters exported in Prometheus format.
///
/// Every instance owns its own registry, so relays running side by side in one
/// process do not share series.
pub struct Metrics {
    registry: Registry,
    sessions_total: IntCounter,
    active_sessions: IntGauge,
    upstream_connect_failures_total: IntCounter,
    bytes_total: IntCounterVec,
    forwarding_errors_total: IntCounterVec,
    session_duration: Histogram,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let sessions_total = IntCounter::new(
            "stratum_relay_sessions_total",
            "Total number of miner connections accepted",
        )?;

        let active_sessions = IntGauge::new(
            "stratum_relay_active_sessions",
            "Number of miner connections currently being relayed",
        )?;

        let upstream_connect_failures_total = IntCounter::new(
            "stratum_relay_upstream_connect_failures_total",
            "Total failed connection attempts to the pool",
        )?;

        let bytes_total = IntCounterVec::new(
            Opts::new(
                "stratum_relay_bytes_total",
                "Total bytes forwarded, by direction",
            ),
            &["direction"],
        )?;

        let forwarding_errors_total = IntCounterVec::new(
            Opts::new(
                "stratum_relay_forwarding_errors_total",
                "Sessions ended by a forwarding error, by direction",
            ),
            &["direction"],
        )?;

        let session_duration = Histogram::with_opts(
            HistogramOpts::new(
                "stratum_relay_session_duration_seconds",
                "Duration of relayed sessions in seconds",
            )
            .buckets(vec![1.0, 10.0, 60.0, 300.0, 1800.0, 3600.0, 21600.0, 86400.0]),
        )?;

        registry
            .register(Box::new(sessions_total.clone()))
            .context("Failed to register sessions_total")?;
        registry
            .register(Box::new(active_sessions.clone()))
            .context("Failed to register active_sessions")?;
        registry
            .register(Box::new(upstream_connect_failures_total.clone()))
            .context("Failed to register upstream_connect_failures_total")?;
        registry
            .register(Box::new(bytes_total.clone()))
            .context("Failed to register bytes_total")?;
        registry
            .register(Box::new(forwarding_errors_total.clone()))
            .context("Failed to register forwarding_errors_total")?;
        registry
            .register(Box::new(session_duration.clone()))
            .context("Failed to register session_duration")?;

        Ok(Self {
            registry,
            sessions_total,
            active_sessions,
            upstream_connect_failures_total,
            bytes_total,
            forwarding_errors_total,
            session_duration,
        })
    }

    /// A miner connection was accepted
    pub fn session_opened(&self) {
        self.sessions_total.inc();
        self.active_sessions.inc();
    }

    /// A miner connection is fully closed
    pub fn session_closed(&self) {
        self.active_sessions.dec();
    }

    pub fn upstream_connect_failed(&self) {
        self.upstream_connect_failures_total.inc();
    }

    /// Fold a finished session into the totals
    pub fn record_session(&self, session: &RelaySession, reason: &CloseReason) {
        self.bytes_total
            .with_label_values(&[Direction::MinerToPool.as_label()])
            .inc_by(session.bytes_up());
        self.bytes_total
            .with_label_values(&[Direction::PoolToMiner.as_label()])
            .inc_by(session.bytes_down());
        self.session_duration
            .observe(session.duration().as_secs_f64());

        if let Some(direction) = reason.failed_direction() {
            self.forwarding_errors_total
                .with_label_values(&[direction.as_label()])
                .inc();
        }
    }

    pub fn active_sessions(&self) -> i64 {
        self.active_sessions.get()
    }

    /// Render all series in the Prometheus text format
    pub fn export_prometheus(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .context("Failed to encode metrics")?;
        String::from_utf8(buffer).context("Metrics output is not valid UTF-8")
    }

    /// Point-in-time copy of the counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sessions_total: self.sessions_total.get(),
            active_sessions: self.active_sessions.get(),
            upstream_connect_failures: self.upstream_connect_failures_total.get(),
            bytes_miner_to_pool: self
                .bytes_total
                .with_label_values(&[Direction::MinerToPool.as_label()])
                .get(),
            bytes_pool_to_miner: self
                .bytes_total
                .with_label_values(&[Direction::PoolToMiner.as_label()])
                .get(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RelayError;
    use std::io;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_session_lifecycle_counters() {
        let metrics = Metrics::new().unwrap();

        metrics.session_opened();
        metrics.session_opened();
        metrics.session_closed();
        metrics.upstream_connect_failed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.sessions_total, 2);
        assert_eq!(snapshot.active_sessions, 1);
        assert_eq!(snapshot.upstream_connect_failures, 1);
    }

    #[test]
    fn test_record_session_bytes_and_errors() {
        let metrics = Metrics::new().unwrap();
        let session = RelaySession::new(
            "127.0.0.1:40000".parse().unwrap(),
            "127.0.0.1:3333".parse().unwrap(),
        );
        session.bytes_up.fetch_add(300, Ordering::Relaxed);
        session.bytes_down.fetch_add(9000, Ordering::Relaxed);

        let reason = CloseReason::Error(RelayError::Read {
            direction: Direction::PoolToMiner,
            source: io::Error::new(io::ErrorKind::ConnectionReset, "reset"),
        });
        metrics.record_session(&session, &reason);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.bytes_miner_to_pool, 300);
        assert_eq!(snapshot.bytes_pool_to_miner, 9000);

        let text = metrics.export_prometheus().unwrap();
        assert!(text.contains("stratum_relay_forwarding_errors_total{direction=\"pool_to_miner\"} 1"));
        assert!(text.contains("stratum_relay_bytes_total{direction=\"miner_to_pool\"} 300"));
    }

    #[test]
    fn test_instances_are_independent() {
        let first = Metrics::new().unwrap();
        let second = Metrics::new().unwrap();

        first.session_opened();
        assert_eq!(first.active_sessions(), 1);
        assert_eq!(second.active_sessions(), 0);
    }
}
