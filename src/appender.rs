//! Ingestion side of the queue.

use std::{
    convert::TryFrom,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use thiserror::Error;
use tracing::debug;

use crate::{
    codec::{self, EncodeError, MAX_BATCH_SAMPLES},
    metrics::QueueMetrics,
    pool::{BufferPool, PooledBuffer},
    sample::{Exemplar, Histogram, Metadata},
    store::{Store, StoreError, StoreKey},
};

/// Opaque series reference handed back to producers. The queue does not
/// track series, so the reference is passed through unchanged.
#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq)]
pub struct SeriesRef(pub u64);

/// Write contract of the ingestion pipeline.
pub trait SampleAppender {
    /// Adds one sample to the pending batch. `labels` holds alternating
    /// names and values.
    fn append<L>(
        &mut self,
        series: SeriesRef,
        labels: &[L],
        timestamp_ms: i64,
        value: f64,
    ) -> Result<SeriesRef, AppendError>
    where
        L: AsRef<str>;

    fn append_exemplar(
        &mut self,
        series: SeriesRef,
        exemplar: &Exemplar,
    ) -> Result<SeriesRef, AppendError>;

    fn append_histogram(
        &mut self,
        series: SeriesRef,
        timestamp_ms: i64,
        histogram: &Histogram,
    ) -> Result<SeriesRef, AppendError>;

    fn update_metadata(
        &mut self,
        series: SeriesRef,
        metadata: &Metadata,
    ) -> Result<SeriesRef, AppendError>;

    /// Persists the pending batch under a new key. Returns `None` when there
    /// was nothing to persist.
    fn commit(self) -> Result<Option<StoreKey>, AppendError>;

    /// Drops the pending batch without touching the store.
    fn rollback(self);
}

/// Builds one batch in a pooled buffer and persists it on commit.
///
/// An appender is used from one thread at a time; create one per commit.
pub struct Appender<S> {
    store: Arc<S>,
    buffer: PooledBuffer,
    samples: usize,
    ttl: Duration,
    metrics: Arc<QueueMetrics>,
}

impl<S> Appender<S>
where
    S: Store,
{
    pub(crate) fn new(
        store: Arc<S>,
        pool: &Arc<BufferPool>,
        ttl: Duration,
        metrics: Arc<QueueMetrics>,
    ) -> Self {
        let mut buffer = pool.acquire();
        codec::put_batch_header(&mut *buffer);

        Self {
            store,
            buffer,
            samples: 0,
            ttl,
            metrics,
        }
    }

    pub fn len(&self) -> usize {
        self.samples
    }

    pub fn is_empty(&self) -> bool {
        self.samples == 0
    }

    fn is_expired(&self, timestamp_ms: i64) -> bool {
        if self.ttl == Duration::from_secs(0) {
            return false;
        }

        let ttl_ms = i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX);
        timestamp_ms < now_ms().saturating_sub(ttl_ms)
    }
}

impl<S> SampleAppender for Appender<S>
where
    S: Store,
{
    fn append<L>(
        &mut self,
        series: SeriesRef,
        labels: &[L],
        timestamp_ms: i64,
        value: f64,
    ) -> Result<SeriesRef, AppendError>
    where
        L: AsRef<str>,
    {
        if self.is_expired(timestamp_ms) {
            self.metrics.record_dropped_ttl();
            return Ok(series);
        }

        if self.samples >= MAX_BATCH_SAMPLES {
            return Err(AppendError::BatchFull(self.samples));
        }

        codec::encode_sample_parts(labels, timestamp_ms, value, &mut *self.buffer)?;
        self.samples += 1;
        self.metrics.record_appended();
        Ok(series)
    }

    fn append_exemplar(
        &mut self,
        _series: SeriesRef,
        _exemplar: &Exemplar,
    ) -> Result<SeriesRef, AppendError> {
        Err(AppendError::Unsupported("exemplars"))
    }

    fn append_histogram(
        &mut self,
        _series: SeriesRef,
        _timestamp_ms: i64,
        _histogram: &Histogram,
    ) -> Result<SeriesRef, AppendError> {
        Err(AppendError::Unsupported("histograms"))
    }

    fn update_metadata(
        &mut self,
        _series: SeriesRef,
        _metadata: &Metadata,
    ) -> Result<SeriesRef, AppendError> {
        Err(AppendError::Unsupported("metadata"))
    }

    fn commit(mut self) -> Result<Option<StoreKey>, AppendError> {
        if self.samples == 0 {
            return Ok(None);
        }

        let batch: &mut [u8] = &mut self.buffer;
        codec::set_batch_count(batch, self.samples)?;
        let key = self.store.commit(batch)?;

        self.metrics.record_committed();
        debug!("committed batch of {} samples with key {}", self.samples, key);
        Ok(Some(key))
    }

    fn rollback(self) {
        debug!("discarding batch of {} samples", self.samples);
    }
}

fn now_ms() -> i64 {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX)
}

#[derive(Debug, Error)]
pub enum AppendError {
    #[error("Batch already holds {0} samples")]
    BatchFull(usize),

    #[error("Failed to encode sample. Caused by: {0}")]
    Encode(#[from] EncodeError),

    #[error("Failed to persist batch. Caused by: {0}")]
    Store(#[from] StoreError),

    #[error("{0} are not supported by the sample queue")]
    Unsupported(&'static str),
}

#[cfg(test)]
pub(crate) fn timestamp_now() -> i64 {
    now_ms()
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Duration};

    use matches::assert_matches;
    use prometheus::Registry;

    use crate::{
        appender::{timestamp_now, AppendError, Appender, SampleAppender, SeriesRef},
        codec::{self, EncodeError, MAX_BATCH_SAMPLES},
        metrics::QueueMetrics,
        pool::BufferPool,
        sample::{Exemplar, Histogram, Metadata, Sample},
        store::{MemoryStore, Store, StoreKey},
    };

    const HOUR: Duration = Duration::from_secs(60 * 60);

    struct Fixture {
        store: Arc<MemoryStore>,
        pool: Arc<BufferPool>,
        metrics: Arc<QueueMetrics>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: Arc::new(MemoryStore::new()),
                pool: Arc::new(BufferPool::new(2, 1024)),
                metrics: Arc::new(QueueMetrics::new(&Registry::new()).unwrap()),
            }
        }

        fn appender(&self, ttl: Duration) -> Appender<MemoryStore> {
            Appender::new(
                Arc::clone(&self.store),
                &self.pool,
                ttl,
                Arc::clone(&self.metrics),
            )
        }
    }

    #[test]
    fn commit_persists_one_batch_in_append_order() {
        let fixture = Fixture::new();
        let now = timestamp_now();
        let mut appender = fixture.appender(HOUR);
        appender
            .append(SeriesRef(1), &["__name__", "up"], now, 1.0)
            .unwrap();
        appender
            .append(SeriesRef(2), &["__name__", "down"], now + 1, 0.0)
            .unwrap();

        let key = appender.commit().unwrap();
        assert_eq!(key, Some(StoreKey::new(1)));

        let batch = fixture.store.signal(StoreKey::new(1)).unwrap().unwrap();
        assert_eq!(
            codec::decode_batch(&batch).unwrap(),
            vec![
                Sample::new(vec!["__name__", "up"], now, 1.0),
                Sample::new(vec!["__name__", "down"], now + 1, 0.0),
            ]
        );
        assert_eq!(fixture.metrics.snapshot().batches_committed, 1);
        assert_eq!(fixture.metrics.snapshot().samples_appended, 2);
    }

    #[test]
    fn concurrent_appenders_commit_under_distinct_keys() {
        let fixture = Arc::new(Fixture::new());
        let producers: Vec<_> = (0..4)
            .map(|producer| {
                let fixture = Arc::clone(&fixture);
                thread::spawn(move || {
                    (0..25)
                        .map(|value| {
                            let mut appender = fixture.appender(HOUR);
                            appender
                                .append(
                                    SeriesRef(producer),
                                    &["__name__", "up"],
                                    timestamp_now(),
                                    f64::from(value),
                                )
                                .unwrap();
                            appender.commit().unwrap().unwrap()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut keys: Vec<StoreKey> = producers
            .into_iter()
            .flat_map(|producer| producer.join().unwrap())
            .collect();
        keys.sort();

        assert_eq!(keys, (1..=100).map(StoreKey::new).collect::<Vec<_>>());
        assert_eq!(fixture.metrics.snapshot().batches_committed, 100);
    }

    #[test]
    fn each_commit_gets_its_own_key() {
        let fixture = Fixture::new();
        for expected in 1..=3 {
            let mut appender = fixture.appender(HOUR);
            appender
                .append(SeriesRef::default(), &["a", "b"], timestamp_now(), 1.0)
                .unwrap();
            assert_eq!(appender.commit().unwrap(), Some(StoreKey::new(expected)));
        }
        assert_eq!(fixture.store.len(), 3);
    }

    #[test]
    fn expired_sample_is_dropped_silently() {
        let fixture = Fixture::new();
        let mut appender = fixture.appender(HOUR);
        let stale = timestamp_now() - 2 * 60 * 60 * 1000;

        let series = appender
            .append(SeriesRef(7), &["a", "b"], stale, 1.0)
            .unwrap();

        assert_eq!(series, SeriesRef(7));
        assert!(appender.is_empty());
        assert_eq!(fixture.metrics.snapshot().samples_dropped_ttl, 1);
        assert_eq!(appender.commit().unwrap(), None);
    }

    #[test]
    fn zero_ttl_keeps_old_samples() {
        let fixture = Fixture::new();
        let mut appender = fixture.appender(Duration::from_secs(0));
        appender.append(SeriesRef(1), &["a", "b"], 0, 1.0).unwrap();
        assert_eq!(appender.len(), 1);
    }

    #[test]
    fn empty_commit_writes_nothing() {
        let fixture = Fixture::new();
        let appender = fixture.appender(HOUR);

        assert_eq!(appender.commit().unwrap(), None);
        assert!(fixture.store.is_empty());
        assert_eq!(fixture.pool.available(), 1);
    }

    #[test]
    fn rollback_returns_buffer_without_writing() {
        let fixture = Fixture::new();
        let mut appender = fixture.appender(HOUR);
        appender
            .append(SeriesRef(1), &["a", "b"], timestamp_now(), 1.0)
            .unwrap();
        appender.rollback();

        assert!(fixture.store.is_empty());
        assert_eq!(fixture.pool.available(), 1);
        assert_eq!(fixture.metrics.snapshot().batches_committed, 0);
    }

    #[test]
    fn buffer_is_returned_after_commit() {
        let fixture = Fixture::new();
        let mut appender = fixture.appender(HOUR);
        appender
            .append(SeriesRef(1), &["a", "b"], timestamp_now(), 1.0)
            .unwrap();
        appender.commit().unwrap();

        assert_eq!(fixture.pool.available(), 1);
        let stats = fixture.pool.stats().snapshot();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.returns, 1);
    }

    #[test]
    fn oversized_label_is_rejected() {
        let fixture = Fixture::new();
        let mut appender = fixture.appender(HOUR);
        let long = "x".repeat(70_000);

        let result = appender.append(
            SeriesRef(1),
            &["name", long.as_str()],
            timestamp_now(),
            1.0,
        );

        assert_matches!(
            result,
            Err(AppendError::Encode(EncodeError::StringTooLong(70_000)))
        );
        assert!(appender.is_empty());
    }

    #[test]
    fn full_batch_is_rejected() {
        let fixture = Fixture::new();
        let mut appender = fixture.appender(Duration::from_secs(0));
        let labels: [&str; 0] = [];
        for _ in 0..MAX_BATCH_SAMPLES {
            appender.append(SeriesRef(1), &labels, 0, 0.0).unwrap();
        }

        assert_matches!(
            appender.append(SeriesRef(1), &labels, 0, 0.0),
            Err(AppendError::BatchFull(MAX_BATCH_SAMPLES))
        );

        let key = appender.commit().unwrap().unwrap();
        let batch = fixture.store.signal(key).unwrap().unwrap();
        assert_eq!(codec::decode_batch(&batch).unwrap().len(), MAX_BATCH_SAMPLES);
    }

    #[test]
    fn unsupported_kinds_fail_explicitly() {
        let fixture = Fixture::new();
        let mut appender = fixture.appender(HOUR);

        assert_matches!(
            appender.append_exemplar(SeriesRef(1), &Exemplar::default()),
            Err(AppendError::Unsupported("exemplars"))
        );
        assert_matches!(
            appender.append_histogram(SeriesRef(1), 0, &Histogram::default()),
            Err(AppendError::Unsupported("histograms"))
        );
        assert_matches!(
            appender.update_metadata(SeriesRef(1), &Metadata::default()),
            Err(AppendError::Unsupported("metadata"))
        );
        assert!(appender.is_empty());
    }
}
