use crate::error::IngestError;
use crate::record::IngestedRecord;
use crate::store::RecordSink;
use chrono::Utc;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Producer side of the bounded persistence queue.
#[derive(Clone)]
pub struct RecordQueue {
    tx: mpsc::Sender<IngestedRecord>,
    stats: Arc<IngestStats>,
}

pub fn channel(
    capacity: usize,
    stats: Arc<IngestStats>,
) -> (RecordQueue, mpsc::Receiver<IngestedRecord>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (RecordQueue { tx, stats }, rx)
}

impl RecordQueue {
    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    /// Waits for a free slot when the queue is full.
    pub async fn enqueue(&self, record: IngestedRecord) -> Result<(), IngestError> {
        let queue_depth = self.stats.queue_depth.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::trace!(queue_depth, site = %record.city, "queued record");
        if self.tx.send(record).await.is_err() {
            self.stats.queue_depth.fetch_sub(1, Ordering::Relaxed);
            return Err(IngestError::QueueClosed);
        }
        self.stats.records_enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct IngestStats {
    pub queue_depth: AtomicU64,
    pub records_enqueued: AtomicU64,
    pub records_written: AtomicU64,
    pub sink_failures: AtomicU64,
    pub site_successes: AtomicU64,
    pub site_failures: AtomicU64,
    pub units_shed: AtomicU64,
    pub last_write_unix_ms: AtomicU64,
    pub last_error: Mutex<Option<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub queue_depth: u64,
    pub records_enqueued: u64,
    pub records_written: u64,
    pub sink_failures: u64,
    pub site_successes: u64,
    pub site_failures: u64,
    pub units_shed: u64,
    pub last_write_unix_ms: Option<u64>,
    pub last_error: Option<String>,
}

impl IngestStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            records_enqueued: self.records_enqueued.load(Ordering::Relaxed),
            records_written: self.records_written.load(Ordering::Relaxed),
            sink_failures: self.sink_failures.load(Ordering::Relaxed),
            site_successes: self.site_successes.load(Ordering::Relaxed),
            site_failures: self.site_failures.load(Ordering::Relaxed),
            units_shed: self.units_shed.load(Ordering::Relaxed),
            last_write_unix_ms: match self.last_write_unix_ms.load(Ordering::Relaxed) {
                0 => None,
                ms => Some(ms),
            },
            last_error: self.last_error.lock().ok().and_then(|guard| guard.clone()),
        }
    }
}

/// Starts the single consumer. It exits once every `RecordQueue` is dropped
/// and the remaining records have been written.
pub fn spawn_worker<S: RecordSink>(
    sink: S,
    mut rx: mpsc::Receiver<IngestedRecord>,
    stats: Arc<IngestStats>,
    write_timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(record) = rx.recv().await {
            stats.queue_depth.fetch_sub(1, Ordering::Relaxed);
            write_record(&sink, &record, &stats, write_timeout).await;
        }
        tracing::info!("persistence queue drained; sink worker exiting");
    })
}

async fn write_record<S: RecordSink>(
    sink: &S,
    record: &IngestedRecord,
    stats: &IngestStats,
    write_timeout: Duration,
) {
    let outcome = match tokio::time::timeout(write_timeout, sink.insert(record)).await {
        Ok(result) => result,
        Err(_) => Err(IngestError::Sink(format!(
            "write exceeded {}s deadline",
            write_timeout.as_secs_f64()
        ))),
    };

    match outcome {
        Ok(()) => {
            stats.records_written.fetch_add(1, Ordering::Relaxed);
            stats
                .last_write_unix_ms
                .store(Utc::now().timestamp_millis().max(0) as u64, Ordering::Relaxed);
            tracing::info!(
                site = %record.city,
                timestamp = %record.timestamp.to_rfc3339(),
                aqi = record.aqi,
                temperature = record.temperature,
                "stored record"
            );
        }
        Err(err) => {
            stats.sink_failures.fetch_add(1, Ordering::Relaxed);
            stats.record_error(err.to_string());
            tracing::error!(
                site = %record.city,
                document_id = %record.document_id(),
                error = %err,
                "failed to store record; dropping it"
            );
        }
    }
}
