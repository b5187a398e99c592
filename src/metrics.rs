//! Prometheus metrics for a queue.
//!
//! | Metric | Type | Labels |
//! |---|---|---|
//! | `sample_queue_samples_appended_total` | Counter | |
//! | `sample_queue_samples_dropped_ttl_total` | Counter | |
//! | `sample_queue_batches_committed_total` | Counter | |
//! | `sample_queue_batches_sent_total` | Counter | `destination` |
//! | `sample_queue_batches_rejected_total` | Counter | `destination` |
//! | `sample_queue_batches_corrupt_total` | Counter | `destination` |
//! | `sample_queue_send_retries_total` | Counter | `destination` |
//! | `sample_queue_bookmark_failures_total` | Counter | `destination` |
//! | `sample_queue_cursor_lag` | Gauge | `destination` |
//!
//! `destination` is the writer's bookmark name, `<queue id>/<remote name>`.

use std::convert::TryFrom;

use prometheus::{IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};

const DESTINATION: &str = "destination";

/// Metrics of one queue. Created by the caller against its own registry and
/// handed to the queue, which shares it with every appender and writer.
#[derive(Clone)]
pub struct QueueMetrics {
    samples_appended: IntCounter,
    samples_dropped_ttl: IntCounter,
    batches_committed: IntCounter,
    batches_sent: IntCounterVec,
    batches_rejected: IntCounterVec,
    batches_corrupt: IntCounterVec,
    send_retries: IntCounterVec,
    bookmark_failures: IntCounterVec,
    cursor_lag: IntGaugeVec,
}

impl QueueMetrics {
    /// Creates the metrics and registers them with `registry`.
    ///
    /// Registering two queues with the same registry fails with a duplicate
    /// collector error.
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let samples_appended = IntCounter::with_opts(Opts::new(
            "sample_queue_samples_appended_total",
            "Samples buffered by appenders",
        ))?;
        registry.register(Box::new(samples_appended.clone()))?;

        let samples_dropped_ttl = IntCounter::with_opts(Opts::new(
            "sample_queue_samples_dropped_ttl_total",
            "Samples dropped at append time for being older than the TTL",
        ))?;
        registry.register(Box::new(samples_dropped_ttl.clone()))?;

        let batches_committed = IntCounter::with_opts(Opts::new(
            "sample_queue_batches_committed_total",
            "Batches durably committed to the store",
        ))?;
        registry.register(Box::new(batches_committed.clone()))?;

        let batches_sent = destination_counter(
            registry,
            "sample_queue_batches_sent_total",
            "Batches accepted by a destination",
        )?;
        let batches_rejected = destination_counter(
            registry,
            "sample_queue_batches_rejected_total",
            "Batches a destination rejected for good and that were skipped",
        )?;
        let batches_corrupt = destination_counter(
            registry,
            "sample_queue_batches_corrupt_total",
            "Stored batches that could not be decoded and were skipped",
        )?;
        let send_retries = destination_counter(
            registry,
            "sample_queue_send_retries_total",
            "Sends that failed and will be retried",
        )?;
        let bookmark_failures = destination_counter(
            registry,
            "sample_queue_bookmark_failures_total",
            "Bookmark writes that failed after a batch was processed",
        )?;

        let cursor_lag = IntGaugeVec::new(
            Opts::new(
                "sample_queue_cursor_lag",
                "Batches between a writer's cursor and the newest stored batch",
            ),
            &[DESTINATION],
        )?;
        registry.register(Box::new(cursor_lag.clone()))?;

        Ok(Self {
            samples_appended,
            samples_dropped_ttl,
            batches_committed,
            batches_sent,
            batches_rejected,
            batches_corrupt,
            send_retries,
            bookmark_failures,
            cursor_lag,
        })
    }

    pub(crate) fn record_appended(&self) {
        self.samples_appended.inc();
    }

    pub(crate) fn record_dropped_ttl(&self) {
        self.samples_dropped_ttl.inc();
    }

    pub(crate) fn record_committed(&self) {
        self.batches_committed.inc();
    }

    /// Metrics of one destination.
    pub fn destination(&self, name: &str) -> DestinationMetrics {
        let labels = [name];
        DestinationMetrics {
            batches_sent: self.batches_sent.with_label_values(&labels),
            batches_rejected: self.batches_rejected.with_label_values(&labels),
            batches_corrupt: self.batches_corrupt.with_label_values(&labels),
            send_retries: self.send_retries.with_label_values(&labels),
            bookmark_failures: self.bookmark_failures.with_label_values(&labels),
            cursor_lag: self.cursor_lag.with_label_values(&labels),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            samples_appended: self.samples_appended.get(),
            samples_dropped_ttl: self.samples_dropped_ttl.get(),
            batches_committed: self.batches_committed.get(),
        }
    }
}

fn destination_counter(
    registry: &Registry,
    name: &str,
    help: &str,
) -> prometheus::Result<IntCounterVec> {
    let counter = IntCounterVec::new(Opts::new(name, help), &[DESTINATION])?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

/// Counters of one writer, bound to its destination label.
#[derive(Clone)]
pub struct DestinationMetrics {
    batches_sent: IntCounter,
    batches_rejected: IntCounter,
    batches_corrupt: IntCounter,
    send_retries: IntCounter,
    bookmark_failures: IntCounter,
    cursor_lag: IntGauge,
}

impl DestinationMetrics {
    pub(crate) fn record_sent(&self) {
        self.batches_sent.inc();
    }

    pub(crate) fn record_rejected(&self) {
        self.batches_rejected.inc();
    }

    pub(crate) fn record_corrupt(&self) {
        self.batches_corrupt.inc();
    }

    pub(crate) fn record_retry(&self) {
        self.send_retries.inc();
    }

    pub(crate) fn record_bookmark_failure(&self) {
        self.bookmark_failures.inc();
    }

    pub(crate) fn set_lag(&self, batches: u64) {
        self.cursor_lag.set(i64::try_from(batches).unwrap_or(i64::MAX));
    }

    pub fn snapshot(&self) -> DestinationSnapshot {
        DestinationSnapshot {
            batches_sent: self.batches_sent.get(),
            batches_rejected: self.batches_rejected.get(),
            batches_corrupt: self.batches_corrupt.get(),
            send_retries: self.send_retries.get(),
            bookmark_failures: self.bookmark_failures.get(),
            cursor_lag: self.cursor_lag.get(),
        }
    }
}

/// Producer side counters.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub samples_appended: u64,
    pub samples_dropped_ttl: u64,
    pub batches_committed: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DestinationSnapshot {
    pub batches_sent: u64,
    pub batches_rejected: u64,
    pub batches_corrupt: u64,
    pub send_retries: u64,
    pub bookmark_failures: u64,
    pub cursor_lag: i64,
}

#[cfg(test)]
mod tests {
    use matches::assert_matches;
    use prometheus::{Encoder, Registry, TextEncoder};

    use super::{DestinationSnapshot, QueueMetrics};

    #[test]
    fn destinations_are_counted_apart() {
        let metrics = QueueMetrics::new(&Registry::new()).unwrap();
        let healthy = metrics.destination("agent/healthy");
        let stalled = metrics.destination("agent/stalled");

        healthy.record_sent();
        healthy.record_sent();
        stalled.record_retry();
        stalled.set_lag(7);

        assert_eq!(
            metrics.destination("agent/healthy").snapshot(),
            DestinationSnapshot {
                batches_sent: 2,
                ..DestinationSnapshot::default()
            }
        );
        assert_eq!(
            metrics.destination("agent/stalled").snapshot(),
            DestinationSnapshot {
                send_retries: 1,
                cursor_lag: 7,
                ..DestinationSnapshot::default()
            }
        );
    }

    #[test]
    fn metrics_are_exported_from_the_registry() {
        let registry = Registry::new();
        let metrics = QueueMetrics::new(&registry).unwrap();
        metrics.record_appended();
        metrics.destination("agent/remote").record_sent();

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&registry.gather(), &mut buffer)
            .unwrap();
        let text = String::from_utf8(buffer).unwrap();

        assert!(text.contains("sample_queue_samples_appended_total 1"));
        assert!(text.contains("sample_queue_batches_sent_total{destination=\"agent/remote\"} 1"));
    }

    #[test]
    fn registering_twice_fails() {
        let registry = Registry::new();
        QueueMetrics::new(&registry).unwrap();

        assert_matches!(
            QueueMetrics::new(&registry).err(),
            Some(prometheus::Error::AlreadyReg)
        );
    }
}
