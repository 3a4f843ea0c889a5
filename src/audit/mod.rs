//! Asynchronous audit pipeline. Producers enqueue without blocking; a
//! bounded queue sheds load by dropping the newest record and bumping a
//! counter. A small pool of workers drains the queue and persists records
//! in batches to the month-partitioned audit store. A failed write is
//! logged and counted, never surfaced to the request that caused it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::models::audit::AuditRecord;
use crate::store::AuditSink;

#[derive(Clone)]
pub struct AuditPipeline {
    tx: mpsc::Sender<AuditRecord>,
    dropped: Arc<AtomicU64>,
    write_failures: Arc<AtomicU64>,
}

impl AuditPipeline {
    /// Start `workers` background consumers draining into `sink`.
    pub fn spawn(
        sink: Arc<dyn AuditSink>,
        queue_capacity: usize,
        workers: usize,
        batch_size: usize,
        flush_interval: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<AuditRecord>(queue_capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let write_failures = Arc::new(AtomicU64::new(0));

        for worker in 0..workers.max(1) {
            let rx = rx.clone();
            let sink = sink.clone();
            let write_failures = write_failures.clone();
            tokio::spawn(async move {
                drain_loop(worker, rx, sink, batch_size.max(1), flush_interval, write_failures)
                    .await;
            });
        }

        Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
            write_failures,
        }
    }

    /// Non-blocking enqueue. A full queue drops the record; the hot path
    /// is never backpressured by auditing.
    pub fn enqueue(&self, record: AuditRecord) {
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(record)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    event_type = %record.event_type,
                    dropped_total = dropped,
                    "audit queue full, record dropped"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::error!("audit queue closed, record dropped");
            }
        }
    }

    /// Monotonic count of records shed on overflow.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn write_failures(&self) -> u64 {
        self.write_failures.load(Ordering::Relaxed)
    }
}

async fn drain_loop(
    worker: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<AuditRecord>>>,
    sink: Arc<dyn AuditSink>,
    batch_size: usize,
    flush_interval: Duration,
    write_failures: Arc<AtomicU64>,
) {
    let mut batch: Vec<AuditRecord> = Vec::with_capacity(batch_size);
    loop {
        batch.clear();
        {
            let mut rx = rx.lock().await;
            match rx.recv().await {
                Some(first) => batch.push(first),
                None => return, // all senders gone
            }
            // Top the batch up with whatever arrives within the window.
            while batch.len() < batch_size {
                match tokio::time::timeout(flush_interval, rx.recv()).await {
                    Ok(Some(record)) => batch.push(record),
                    Ok(None) | Err(_) => break,
                }
            }
        }

        if let Err(e) = sink.insert_audit_batch(&batch).await {
            write_failures.fetch_add(batch.len() as u64, Ordering::Relaxed);
            tracing::error!(worker, count = batch.len(), "audit batch write failed: {}", e);
        } else {
            tracing::debug!(worker, count = batch.len(), "audit batch persisted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::audit::AuditDecision;
    use crate::store::memory::MemoryStore;
    use uuid::Uuid;

    fn record(org: Uuid) -> AuditRecord {
        AuditRecord::decision(
            org,
            "u-1".to_string(),
            "document".to_string(),
            "d1".to_string(),
            "read".to_string(),
            true,
            "permission:allow matched".to_string(),
            "digest".to_string(),
        )
    }

    #[tokio::test]
    async fn records_are_persisted_in_background() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = AuditPipeline::spawn(
            store.clone(),
            1024,
            2,
            16,
            Duration::from_millis(10),
        );

        let org = Uuid::new_v4();
        for _ in 0..10 {
            pipeline.enqueue(record(org));
        }

        // Let the workers drain.
        for _ in 0..50 {
            if store.audit_records().len() == 10 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let records = store.audit_records();
        assert_eq!(records.len(), 10);
        assert!(records.iter().all(|r| r.decision == AuditDecision::Allow));
        assert_eq!(pipeline.dropped(), 0);
    }

    #[tokio::test]
    async fn overflow_drops_newest_and_counts() {
        struct StallingSink;
        #[async_trait::async_trait]
        impl AuditSink for StallingSink {
            async fn insert_audit_batch(&self, _records: &[AuditRecord]) -> anyhow::Result<()> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
        }

        let pipeline = AuditPipeline::spawn(
            Arc::new(StallingSink),
            4,
            1,
            1,
            Duration::from_millis(1),
        );

        let org = Uuid::new_v4();
        for _ in 0..64 {
            pipeline.enqueue(record(org));
        }
        // Queue capacity 4 plus whatever the worker pulled; the rest dropped.
        assert!(pipeline.dropped() >= 64 - 8);
    }

    #[tokio::test]
    async fn write_failures_never_propagate() {
        struct FailingSink;
        #[async_trait::async_trait]
        impl AuditSink for FailingSink {
            async fn insert_audit_batch(&self, _records: &[AuditRecord]) -> anyhow::Result<()> {
                anyhow::bail!("partition missing")
            }
        }

        let pipeline = AuditPipeline::spawn(
            Arc::new(FailingSink),
            64,
            1,
            4,
            Duration::from_millis(5),
        );
        pipeline.enqueue(record(Uuid::new_v4()));

        for _ in 0..50 {
            if pipeline.write_failures() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(pipeline.write_failures() >= 1);
    }
}
