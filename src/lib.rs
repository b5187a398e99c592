#![deny(rust_2018_idioms)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::cast_possible_truncation,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::use_self
)]

//! Durable sample queue.
//!
//! Samples are buffered by an [`Appender`], committed as one immutable batch
//! per commit into a durable [`Store`], and delivered to every configured
//! destination by an independent [`Writer`] that tracks its progress with a
//! persisted bookmark.

pub mod appender;
pub mod arena;
pub mod codec;
pub mod label_cache;
pub mod metrics;
pub mod pool;
pub mod queue;
pub mod remote;
pub mod sample;
pub mod settings;
pub mod store;
pub mod writer;

pub use crate::appender::{AppendError, Appender, SampleAppender, SeriesRef};
pub use crate::label_cache::{LabelCache, LabelCacheError};
pub use crate::metrics::{DestinationMetrics, QueueMetrics};
pub use crate::queue::{Queue, QueueError};
pub use crate::remote::{Label, Point, RemoteClient, SendOutcome, TimeSeries};
pub use crate::sample::Sample;
pub use crate::settings::Settings;
pub use crate::store::{Bookmark, MemoryStore, SledStore, Store, StoreError, StoreKey};
pub use crate::writer::{CursorHandle, Writer, WriterShutdownHandle};
