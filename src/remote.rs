//! Destination side of the queue.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{codec::SampleRef, sample::Sample};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Label {
    pub name: String,
    pub value: String,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Point {
    pub timestamp: i64,
    pub value: f64,
}

/// One series with a single point, the unit a [`RemoteClient`] sends.
#[derive(Clone, Debug, PartialEq)]
pub struct TimeSeries {
    pub labels: Vec<Label>,
    pub point: Point,
}

impl TimeSeries {
    fn from_pairs<'a>(pairs: impl Iterator<Item = (&'a str, &'a str)>, point: Point) -> Self {
        let labels = pairs
            .map(|(name, value)| Label {
                name: name.to_owned(),
                value: value.to_owned(),
            })
            .collect();
        Self { labels, point }
    }
}

impl From<&SampleRef<'_>> for TimeSeries {
    fn from(sample: &SampleRef<'_>) -> Self {
        Self::from_pairs(
            sample.label_pairs(),
            Point {
                timestamp: sample.timestamp,
                value: sample.value,
            },
        )
    }
}

impl From<&Sample> for TimeSeries {
    fn from(sample: &Sample) -> Self {
        Self::from_pairs(
            sample.label_pairs(),
            Point {
                timestamp: sample.timestamp,
                value: sample.value,
            },
        )
    }
}

/// Result of handing one batch to a destination.
#[derive(Debug)]
pub enum SendOutcome {
    /// The destination stored the batch.
    Accepted,

    /// The destination refused the batch for good. Resending cannot help, so
    /// the batch counts as consumed.
    Rejected(String),

    /// The batch may succeed later and is retried at the same position.
    Transient(anyhow::Error),
}

// Error texts remote-write backends use for data they will never accept.
const TERMINAL_SIGNATURES: &[&str] = &[
    "out of order sample",
    "out of bounds",
    "duplicate sample for timestamp",
    "sample has been rejected",
];

impl SendOutcome {
    /// Sorts an error from a client that only reports text into a terminal
    /// rejection or a transient failure.
    pub fn classify(error: anyhow::Error) -> Self {
        let message = format!("{:#}", error).to_lowercase();
        if TERMINAL_SIGNATURES
            .iter()
            .any(|signature| message.contains(signature))
        {
            SendOutcome::Rejected(message)
        } else {
            SendOutcome::Transient(error)
        }
    }
}

/// A remote-write destination.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Stable destination name. Used to derive the writer's bookmark name, so
    /// changing it restarts delivery from the oldest stored batch.
    fn name(&self) -> String;

    async fn append(&self, series: Vec<TimeSeries>) -> SendOutcome;
}

#[async_trait]
impl<C> RemoteClient for Arc<C>
where
    C: RemoteClient + ?Sized,
{
    fn name(&self) -> String {
        (**self).name()
    }

    async fn append(&self, series: Vec<TimeSeries>) -> SendOutcome {
        (**self).append(series).await
    }
}
