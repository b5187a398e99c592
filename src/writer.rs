//! Delivery loop for one destination.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::{select, sync::oneshot, time};
use tracing::{debug, error, info, warn};

use crate::{
    arena::Arena,
    codec,
    metrics::{DestinationMetrics, QueueMetrics},
    remote::{RemoteClient, SendOutcome, TimeSeries},
    settings::WriterSettings,
    store::{Bookmark, Store, StoreError, StoreKey},
};

/// Reads committed batches in key order and hands them to one destination.
///
/// Progress is recorded in a bookmark named `<parent id>/<destination>`. A
/// batch is marked processed only after the destination accepted it or
/// rejected it for good, so delivery is at least once.
pub struct Writer<S, C> {
    bookmark_name: String,
    store: Arc<S>,
    client: C,
    arena: Arena,
    cursor: CursorHandle,
    last_processed: StoreKey,
    settings: WriterSettings,
    metrics: DestinationMetrics,
    shutdown_send: Option<oneshot::Sender<()>>,
    shutdown_recv: oneshot::Receiver<()>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Tick {
    /// Nothing new to deliver.
    Idle,

    /// The cursor moved and a newer batch is already stored.
    Advanced,

    /// The cursor moved onto the newest stored batch.
    CaughtUp,

    /// The batch at the cursor has to be sent again.
    Retry,
}

impl<S, C> Writer<S, C>
where
    S: Store,
    C: RemoteClient,
{
    /// Creates a writer and positions its cursor from the stored bookmark.
    ///
    /// Without a bookmark the writer starts at the oldest stored batch, or at
    /// key 1 when the store is empty.
    pub fn new(
        parent_id: &str,
        store: Arc<S>,
        client: C,
        settings: &WriterSettings,
        metrics: Arc<QueueMetrics>,
    ) -> Result<Self, WriterError> {
        let bookmark_name = format!("{}/{}", parent_id, client.name());
        let metrics = metrics.destination(&bookmark_name);

        let (cursor, last_processed) = match store.bookmark(&bookmark_name)? {
            Some(bookmark) => {
                info!(
                    "resuming delivery for {} after key {}",
                    bookmark_name, bookmark.key
                );
                (bookmark.key, bookmark.key)
            }
            None => {
                let oldest = store.oldest_key()?;
                let start = if oldest.is_none() {
                    StoreKey::new(1)
                } else {
                    oldest
                };
                info!("starting delivery for {} at key {}", bookmark_name, start);
                (start, StoreKey::NONE)
            }
        };

        let (shutdown_send, shutdown_recv) = oneshot::channel();

        Ok(Self {
            cursor: CursorHandle::new(&bookmark_name, cursor),
            bookmark_name,
            store,
            client,
            arena: Arena::new(),
            last_processed,
            settings: settings.clone(),
            metrics,
            shutdown_send: Some(shutdown_send),
            shutdown_recv,
        })
    }

    pub fn bookmark_name(&self) -> &str {
        &self.bookmark_name
    }

    pub fn cursor(&self) -> CursorHandle {
        self.cursor.clone()
    }

    /// Returns a shutdown handle of the writer.
    pub fn handle(&mut self) -> WriterShutdownHandle {
        WriterShutdownHandle(self.shutdown_send.take())
    }

    /// Runs the delivery loop until shutdown is requested.
    ///
    /// Shutdown is observed between ticks, so a batch that is being sent is
    /// finished and its bookmark written before the loop exits.
    pub async fn run(mut self) {
        info!("starting writer {}...", self.bookmark_name);

        // keeps the channel open when nobody asked for a handle
        let _shutdown_send = self.shutdown_send.take();

        loop {
            let delay = match self.tick().await {
                Ok(Tick::Advanced) => self.settings.fast_drain_interval(),
                Ok(Tick::Idle) | Ok(Tick::CaughtUp) | Ok(Tick::Retry) => {
                    self.settings.poll_interval()
                }
                Err(e) => {
                    error!("failed to read from store. Caused by: {}", e);
                    self.settings.poll_interval()
                }
            };
            self.record_lag();

            select! {
                _ = &mut self.shutdown_recv => {
                    debug!("received shutdown signal for writer");
                    break;
                }
                _ = time::sleep(delay) => {}
            }
        }

        info!("writer {} stopped", self.bookmark_name);
    }

    /// Processes at most one batch.
    pub(crate) async fn tick(&mut self) -> Result<Tick, StoreError> {
        let mut current = self.cursor.key();
        if current == self.last_processed {
            let next = self.store.next_key(current)?;
            if next == current {
                return Ok(Tick::Idle);
            }
            current = next;
            self.cursor.set(current);
        }

        let batch = match self.store.signal(current)? {
            Some(batch) => batch,
            None => {
                let next = self.store.next_key(current)?;
                if next == current {
                    return Ok(Tick::Idle);
                }
                debug!("batch {} is gone, moving on to {}", current, next);
                self.cursor.set(next);
                return Ok(Tick::Advanced);
            }
        };

        self.arena.reset();
        let decoded = codec::decode_batch_in(&batch, &self.arena)
            .map(|samples| samples.iter().map(TimeSeries::from).collect::<Vec<_>>());

        let series = match decoded {
            Ok(series) => series,
            Err(e) => {
                error!("skipping undecodable batch {}. Caused by: {}", current, e);
                self.metrics.record_corrupt();
                return self.advance(current);
            }
        };

        debug!("sending batch {} with {} series", current, series.len());
        match self.client.append(series).await {
            SendOutcome::Accepted => {
                self.metrics.record_sent();
                self.advance(current)
            }
            SendOutcome::Rejected(reason) => {
                warn!("destination rejected batch {}: {}", current, reason);
                self.metrics.record_rejected();
                self.advance(current)
            }
            SendOutcome::Transient(e) => {
                warn!("failed to send batch {}, will retry. Caused by: {:#}", current, e);
                self.metrics.record_retry();
                Ok(Tick::Retry)
            }
        }
    }

    fn record_lag(&self) {
        match self.store.newest_key() {
            Ok(newest) => self
                .metrics
                .set_lag(newest.get().saturating_sub(self.cursor.key().get())),
            Err(e) => debug!("unable to read newest key for lag. Caused by: {}", e),
        }
    }

    fn advance(&mut self, processed: StoreKey) -> Result<Tick, StoreError> {
        let bookmark = Bookmark { key: processed };
        if let Err(e) = self.store.write_bookmark(&self.bookmark_name, &bookmark) {
            error!(
                "failed to write bookmark for batch {}, it will be sent again. Caused by: {}",
                processed, e
            );
            self.metrics.record_bookmark_failure();
            return Ok(Tick::Retry);
        }
        self.last_processed = processed;

        let next = self.store.next_key(processed)?;
        self.cursor.set(next);
        if next == processed {
            Ok(Tick::CaughtUp)
        } else {
            Ok(Tick::Advanced)
        }
    }
}

/// Read access to a writer's cursor from outside its task.
#[derive(Clone, Debug)]
pub struct CursorHandle {
    name: Arc<str>,
    key: Arc<RwLock<StoreKey>>,
}

impl CursorHandle {
    fn new(name: &str, key: StoreKey) -> Self {
        Self {
            name: Arc::from(name),
            key: Arc::new(RwLock::new(key)),
        }
    }

    /// Bookmark name of the writer.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Key of the batch the writer is working on, or the last processed one
    /// when it is caught up.
    pub fn key(&self) -> StoreKey {
        *self.key.read()
    }

    fn set(&self, key: StoreKey) {
        *self.key.write() = key;
    }
}

/// Writer shutdown handle.
pub struct WriterShutdownHandle(Option<oneshot::Sender<()>>);

impl WriterShutdownHandle {
    /// Sends a signal to shutdown the writer.
    pub async fn shutdown(mut self) {
        if let Some(sender) = self.0.take() {
            if sender.send(()).is_err() {
                error!("unable to request shutdown for writer.");
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WriterError {
    #[error("Failed to load writer position from store. Caused by: {0}")]
    Store(#[from] StoreError),
}
