use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;

use crate::store::FlushOptions;

pub const DEFAULTS: &str = include_str!("../config/default.json");
pub const ENVIRONMENT_PREFIX: &str = "sample_queue";
pub const ENVIRONMENT_SEPARATOR: &str = "__";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Settings {
    queue: QueueSettings,
    writer: WriterSettings,
}

impl Settings {
    /// Loads the embedded defaults overridden by `SAMPLE_QUEUE_*` variables,
    /// for example `SAMPLE_QUEUE_QUEUE__TTL=30m`.
    pub fn new() -> Result<Self, ConfigError> {
        let mut config = Config::new();

        config.merge(File::from_str(DEFAULTS, FileFormat::Json))?;
        config.merge(environment())?;

        config.try_into()
    }

    pub fn from_file<P>(path: P) -> Result<Self, ConfigError>
    where
        P: AsRef<Path>,
    {
        let mut config = Config::new();

        config.merge(File::from_str(DEFAULTS, FileFormat::Json))?;
        config.merge(File::from(path.as_ref()))?;
        config.merge(environment())?;

        config.try_into()
    }

    pub fn from_parts(queue: QueueSettings, writer: WriterSettings) -> Self {
        Self { queue, writer }
    }

    pub fn queue(&self) -> &QueueSettings {
        &self.queue
    }

    pub fn writer(&self) -> &WriterSettings {
        &self.writer
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENVIRONMENT_PREFIX).separator(ENVIRONMENT_SEPARATOR)
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QueueSettings {
    directory: PathBuf,
    #[serde(with = "humantime_serde")]
    ttl: Duration,
    flush_after_writes: usize,
    pool_size: usize,
    buffer_capacity: usize,
}

impl QueueSettings {
    pub fn new(
        directory: impl Into<PathBuf>,
        ttl: Duration,
        flush_after_writes: usize,
        pool_size: usize,
        buffer_capacity: usize,
    ) -> Self {
        Self {
            directory: directory.into(),
            ttl,
            flush_after_writes,
            pool_size,
            buffer_capacity,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Samples older than this at append time are dropped. Zero keeps
    /// everything.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn flush_options(&self) -> FlushOptions {
        FlushOptions::from_write_count(self.flush_after_writes)
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self::new(
            "data/sample-queue",
            Duration::from_secs(2 * 60 * 60),
            1,
            16,
            1024 * 1024,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WriterSettings {
    #[serde(with = "humantime_serde")]
    poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    fast_drain_interval: Duration,
}

impl WriterSettings {
    pub fn new(poll_interval: Duration, fast_drain_interval: Duration) -> Self {
        Self {
            poll_interval,
            fast_drain_interval,
        }
    }

    /// Wait after a tick that found nothing new or has to retry.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Wait after a tick that moved on while more batches are waiting.
    pub fn fast_drain_interval(&self) -> Duration {
        self.fast_drain_interval
    }
}

impl Default for WriterSettings {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_millis(10))
    }
}
