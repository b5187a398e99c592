use std::sync::Arc;

use futures_util::future;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn};
use tracing_futures::Instrument;

use crate::{
    appender::Appender,
    label_cache::{LabelCache, LabelCacheError},
    metrics::QueueMetrics,
    pool::BufferPool,
    remote::RemoteClient,
    settings::Settings,
    store::{SledStore, Store, StoreError},
    writer::{CursorHandle, Writer, WriterError, WriterShutdownHandle},
};

/// Durable queue between ingestion and remote write.
///
/// The queue owns the store, the encode buffer pool and the label
/// dictionary. It hands out appenders and runs one writer task per
/// destination. Dropping the queue without calling [`Queue::stop`] also
/// stops the writers, at the end of their current tick.
pub struct Queue<S> {
    id: String,
    store: Arc<S>,
    pool: Arc<BufferPool>,
    labels: LabelCache<S>,
    settings: Settings,
    metrics: Arc<QueueMetrics>,
    writers: Mutex<Vec<RunningWriter>>,
}

struct RunningWriter {
    cursor: CursorHandle,
    shutdown: WriterShutdownHandle,
    task: JoinHandle<()>,
}

impl Queue<SledStore> {
    /// Opens the on-disk queue in the configured directory.
    pub fn open(
        id: impl Into<String>,
        settings: &Settings,
        metrics: Arc<QueueMetrics>,
    ) -> Result<Self, QueueError> {
        let queue_settings = settings.queue();
        let store = SledStore::open(queue_settings.directory(), queue_settings.flush_options())?;
        Self::new(id, Arc::new(store), settings, metrics)
    }
}

impl<S> Queue<S>
where
    S: Store + 'static,
{
    pub fn new(
        id: impl Into<String>,
        store: Arc<S>,
        settings: &Settings,
        metrics: Arc<QueueMetrics>,
    ) -> Result<Self, QueueError> {
        let id = id.into();
        let labels = LabelCache::open(Arc::clone(&store))?;
        let pool = Arc::new(BufferPool::new(
            settings.queue().pool_size(),
            settings.queue().buffer_capacity(),
        ));
        info!("sample queue {} ready", id);

        Ok(Self {
            id,
            store,
            pool,
            labels,
            settings: settings.clone(),
            metrics,
            writers: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn labels(&self) -> &LabelCache<S> {
        &self.labels
    }

    pub fn metrics(&self) -> &Arc<QueueMetrics> {
        &self.metrics
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Creates an appender for one batch.
    pub fn appender(&self) -> Appender<S> {
        Appender::new(
            Arc::clone(&self.store),
            &self.pool,
            self.settings.queue().ttl(),
            Arc::clone(&self.metrics),
        )
    }

    /// Spawns a writer for `client` on the current tokio runtime.
    ///
    /// Destinations are told apart by [`RemoteClient::name`]; starting a
    /// second writer under a name that is already running fails.
    pub fn start_writer<C>(&self, client: C) -> Result<CursorHandle, QueueError>
    where
        C: RemoteClient + 'static,
    {
        let mut writers = self.writers.lock();

        let mut writer = Writer::new(
            &self.id,
            Arc::clone(&self.store),
            client,
            self.settings.writer(),
            Arc::clone(&self.metrics),
        )?;
        if writers
            .iter()
            .any(|running| running.cursor.name() == writer.bookmark_name())
        {
            return Err(QueueError::DuplicateDestination(
                writer.bookmark_name().to_owned(),
            ));
        }

        let cursor = writer.cursor();
        let shutdown = writer.handle();
        let name = cursor.name().to_owned();
        let task = tokio::spawn(writer.run().instrument(info_span!("writer", name = %name)));
        debug!("started writer {}", name);

        writers.push(RunningWriter {
            cursor: cursor.clone(),
            shutdown,
            task,
        });
        Ok(cursor)
    }

    /// Starts one writer per client.
    pub fn start<I, C>(&self, clients: I) -> Result<Vec<CursorHandle>, QueueError>
    where
        I: IntoIterator<Item = C>,
        C: RemoteClient + 'static,
    {
        clients
            .into_iter()
            .map(|client| self.start_writer(client))
            .collect()
    }

    /// Signals every writer and waits for their loops to exit.
    pub async fn stop(&self) {
        let writers = std::mem::take(&mut *self.writers.lock());
        debug!("sending shutdown request to {} writers...", writers.len());

        let mut tasks = Vec::with_capacity(writers.len());
        let mut shutdowns = Vec::with_capacity(writers.len());
        for writer in writers {
            tasks.push((writer.cursor.name().to_owned(), writer.task));
            shutdowns.push(writer.shutdown.shutdown());
        }
        future::join_all(shutdowns).await;

        debug!("waiting for all writers to exit...");
        for (name, task) in tasks {
            match task.await {
                Ok(()) => debug!("writer {} exited", name),
                Err(e) => warn!(error = %e, "writer {} panicked", name),
            }
        }

        info!("all writers stopped");
    }

    /// Deletes batches every destination of this queue has finished with and
    /// returns how many were removed.
    ///
    /// The bound is the smallest bookmark saved under this queue's id, so a
    /// destination that is not running right now still keeps its backlog.
    /// Nothing is deleted while no bookmark exists or while a running writer
    /// has yet to finish its first batch.
    pub fn prune(&self) -> Result<usize, QueueError> {
        let running: Vec<String> = self
            .writers
            .lock()
            .iter()
            .map(|running| running.cursor.name().to_owned())
            .collect();

        let saved = self.store.bookmarks(&format!("{}/", self.id))?;
        if running
            .iter()
            .any(|name| saved.iter().all(|(saved_name, _)| saved_name != name))
        {
            return Ok(0);
        }

        match saved.iter().map(|(_, bookmark)| bookmark.key).min() {
            Some(key) => {
                let removed = self.store.delete_keys_older_than(key)?;
                debug!("pruned {} delivered batches below key {}", removed, key);
                Ok(removed)
            }
            None => Ok(0),
        }
    }

    /// How many batches each running writer is behind the newest one.
    pub fn lag(&self) -> Result<Vec<(String, u64)>, QueueError> {
        let newest = self.store.newest_key()?;
        Ok(self
            .writers
            .lock()
            .iter()
            .map(|running| {
                let cursor = running.cursor.key();
                (
                    running.cursor.name().to_owned(),
                    newest.get().saturating_sub(cursor.get()),
                )
            })
            .collect())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Failed to access sample store. Caused by: {0}")]
    Store(#[from] StoreError),

    #[error("Failed to load label dictionary. Caused by: {0}")]
    Labels(#[from] LabelCacheError),

    #[error("Failed to start writer. Caused by: {0}")]
    Writer(#[from] WriterError),

    #[error("A writer for {0} is already running")]
    DuplicateDestination(String),
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use anyhow::anyhow;
    use async_trait::async_trait;
    use matches::assert_matches;

    use crate::{
        appender::{timestamp_now, SampleAppender, SeriesRef},
        queue::{Queue, QueueError},
        remote::{RemoteClient, SendOutcome, TimeSeries},
        settings::{QueueSettings, Settings, WriterSettings},
        store::{Bookmark, MemoryStore, Store, StoreError, StoreKey},
        writer::tests::{metrics, FakeClient},
    };

    struct UnreachableClient;

    #[async_trait]
    impl RemoteClient for UnreachableClient {
        fn name(&self) -> String {
            "unreachable".to_string()
        }

        async fn append(&self, _series: Vec<TimeSeries>) -> SendOutcome {
            SendOutcome::Transient(anyhow!("connection refused"))
        }
    }

    fn settings() -> Settings {
        Settings::from_parts(
            QueueSettings::default(),
            WriterSettings::new(Duration::from_millis(5), Duration::from_millis(1)),
        )
    }

    fn queue() -> Queue<MemoryStore> {
        Queue::new(
            "agent",
            Arc::new(MemoryStore::new()),
            &settings(),
            metrics(),
        )
        .unwrap()
    }

    fn commit(queue: &Queue<MemoryStore>, value: f64) -> StoreKey {
        let mut appender = queue.appender();
        appender
            .append(SeriesRef(1), &["__name__", "up"], timestamp_now(), value)
            .unwrap();
        appender.commit().unwrap().unwrap()
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        for _ in 0..1000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn committed_batches_reach_the_destination() {
        let queue = queue();
        let client = FakeClient::default();
        let cursor = queue.start_writer(client.clone()).unwrap();
        assert_eq!(cursor.name(), "agent/remote");

        commit(&queue, 1.0);
        commit(&queue, 2.0);
        wait_until(|| client.sent_values().len() == 2).await;
        queue.stop().await;

        assert_eq!(client.sent_values(), vec![1.0, 2.0]);
        assert_eq!(
            queue
                .store()
                .bookmark("agent/remote")
                .unwrap()
                .map(|bookmark| bookmark.key),
            Some(StoreKey::new(2))
        );
        assert_eq!(
            queue
                .metrics()
                .destination("agent/remote")
                .snapshot()
                .batches_sent,
            2
        );
    }

    #[tokio::test]
    async fn duplicate_destination_is_refused() {
        let queue = queue();
        queue.start_writer(FakeClient::default()).unwrap();

        assert_matches!(
            queue.start_writer(FakeClient::default()),
            Err(QueueError::DuplicateDestination(name)) if name == "agent/remote"
        );
        queue.stop().await;
    }

    #[test]
    fn error_messages_are_capitalized() {
        assert_eq!(
            QueueError::DuplicateDestination("agent/remote".to_string()).to_string(),
            "A writer for agent/remote is already running"
        );
        assert_eq!(
            QueueError::from(StoreError::Unavailable("disk full".to_string())).to_string(),
            "Failed to access sample store. Caused by: Store unavailable: disk full"
        );
    }

    #[tokio::test]
    async fn start_runs_every_destination() {
        let queue = queue();
        let delivered = FakeClient::default();
        commit(&queue, 1.0);

        let clients: Vec<Arc<dyn RemoteClient>> =
            vec![Arc::new(delivered.clone()), Arc::new(UnreachableClient)];
        let cursors = queue.start(clients).unwrap();
        assert_eq!(cursors.len(), 2);

        wait_until(|| delivered.sent_values().len() == 1).await;
        queue.stop().await;
    }

    #[tokio::test]
    async fn prune_keeps_batches_a_writer_still_needs() {
        let queue = queue();
        for value in 1..=3 {
            commit(&queue, f64::from(value));
        }
        assert_eq!(queue.prune().unwrap(), 0);

        let delivered = FakeClient::default();
        queue.start_writer(delivered.clone()).unwrap();
        queue.start_writer(UnreachableClient).unwrap();
        wait_until(|| delivered.sent_values().len() == 3).await;

        assert_eq!(queue.prune().unwrap(), 0);
        assert_eq!(queue.store().len(), 3);
        queue.stop().await;
    }

    #[tokio::test]
    async fn prune_removes_batches_every_writer_finished() {
        let queue = queue();
        for value in 1..=3 {
            commit(&queue, f64::from(value));
        }

        queue.start_writer(FakeClient::default()).unwrap();
        wait_until(|| {
            queue
                .store()
                .bookmark("agent/remote")
                .unwrap()
                .map(|bookmark| bookmark.key)
                == Some(StoreKey::new(3))
        })
        .await;

        assert_eq!(queue.prune().unwrap(), 2);
        assert_eq!(queue.store().oldest_key().unwrap(), StoreKey::new(3));
        queue.stop().await;

        assert_eq!(queue.prune().unwrap(), 0);
    }

    #[tokio::test]
    async fn prune_keeps_backlog_of_destinations_not_started_yet() {
        let store = Arc::new(MemoryStore::new());
        let queue = Queue::new("agent", Arc::clone(&store), &settings(), metrics()).unwrap();
        for value in 1..=3 {
            commit(&queue, f64::from(value));
        }
        let saved = |key| Bookmark {
            key: StoreKey::new(key),
        };
        store.write_bookmark("agent/remote", &saved(3)).unwrap();
        store.write_bookmark("agent/unreachable", &saved(1)).unwrap();
        store.write_bookmark("other/remote", &saved(0)).unwrap();

        queue.start_writer(FakeClient::default()).unwrap();
        assert_eq!(queue.prune().unwrap(), 0);
        assert_eq!(queue.store().oldest_key().unwrap(), StoreKey::new(1));

        store.write_bookmark("agent/unreachable", &saved(2)).unwrap();
        assert_eq!(queue.prune().unwrap(), 1);
        assert_eq!(queue.store().oldest_key().unwrap(), StoreKey::new(2));
        queue.stop().await;
    }

    #[tokio::test]
    async fn lag_reports_undelivered_batches() {
        let queue = queue();
        for value in 1..=3 {
            commit(&queue, f64::from(value));
        }
        queue.start_writer(UnreachableClient).unwrap();

        assert_eq!(
            queue.lag().unwrap(),
            vec![("agent/unreachable".to_string(), 2)]
        );
        queue.stop().await;
    }

    #[test]
    fn appenders_share_the_metrics_handle() {
        let metrics = metrics();
        let queue = Queue::new(
            "agent",
            Arc::new(MemoryStore::new()),
            &settings(),
            Arc::clone(&metrics),
        )
        .unwrap();

        commit(&queue, 1.0);
        commit(&queue, 2.0);

        assert_eq!(metrics.snapshot().batches_committed, 2);
        assert_eq!(metrics.snapshot().samples_appended, 2);
    }
}
