use std::fmt;

/// A single metric sample.
///
/// `labels` is a flattened list of alternating label names and values, so it
/// always has an even number of elements.
#[derive(Clone, Default)]
pub struct Sample {
    pub labels: Vec<String>,
    pub timestamp: i64,
    pub value: f64,
}

impl Sample {
    pub fn new<L, S>(labels: L, timestamp: i64, value: f64) -> Self
    where
        L: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            labels: labels.into_iter().map(Into::into).collect(),
            timestamp,
            value,
        }
    }

    /// Iterates over `(name, value)` label pairs.
    pub fn label_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.labels
            .chunks_exact(2)
            .map(|pair| (pair[0].as_str(), pair[1].as_str()))
    }
}

// Values compare bit for bit so NaN samples survive a round trip check.
impl PartialEq for Sample {
    fn eq(&self, other: &Self) -> bool {
        self.labels == other.labels
            && self.timestamp == other.timestamp
            && self.value.to_bits() == other.value.to_bits()
    }
}

impl Eq for Sample {}

impl fmt::Debug for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sample")
            .field("labels", &self.labels)
            .field("timestamp", &self.timestamp)
            .field("value", &self.value)
            .finish()
    }
}

/// Exemplar attached to a series. Accepted by the appender interface only.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Exemplar {
    pub labels: Vec<String>,
    pub timestamp: i64,
    pub value: f64,
}

/// Native histogram point. Accepted by the appender interface only.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Histogram {
    pub count: u64,
    pub sum: f64,
    pub schema: i32,
    pub positive_buckets: Vec<i64>,
    pub negative_buckets: Vec<i64>,
}

/// Series metadata. Accepted by the appender interface only.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Metadata {
    pub metric_type: String,
    pub unit: String,
    pub help: String,
}
