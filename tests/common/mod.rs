use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use parking_lot::Mutex;

use sample_queue::{Queue, RemoteClient, SampleAppender, SendOutcome, SeriesRef, Store, TimeSeries};

/// Destination that records every batch and answers from a script,
/// accepting once the script runs out.
#[derive(Clone)]
pub struct RecordingClient {
    name: String,
    batches: Arc<Mutex<Vec<Vec<TimeSeries>>>>,
    responses: Arc<Mutex<VecDeque<SendOutcome>>>,
}

impl RecordingClient {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            batches: Arc::default(),
            responses: Arc::default(),
        }
    }

    pub fn respond_with(self, outcome: SendOutcome) -> Self {
        self.responses.lock().push_back(outcome);
        self
    }

    pub fn batches(&self) -> Vec<Vec<TimeSeries>> {
        self.batches.lock().clone()
    }

    pub fn values(&self) -> Vec<f64> {
        self.batches
            .lock()
            .iter()
            .flatten()
            .map(|series| series.point.value)
            .collect()
    }
}

#[async_trait]
impl RemoteClient for RecordingClient {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn append(&self, series: Vec<TimeSeries>) -> SendOutcome {
        self.batches.lock().push(series);
        let scripted = self.responses.lock().pop_front();
        scripted.unwrap_or(SendOutcome::Accepted)
    }
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}

/// Commits one batch holding a single `up` sample per value.
pub fn commit<S: Store + 'static>(queue: &Queue<S>, values: &[f64]) {
    let mut appender = queue.appender();
    for value in values {
        appender
            .append(SeriesRef(1), &["__name__", "up", "job", "node"], now_ms(), *value)
            .unwrap();
    }
    appender.commit().unwrap();
}

pub async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
