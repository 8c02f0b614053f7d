use anyhow::Result;
use batchport_core::RowBatch;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Duration, Instant};
use tracing::debug;

use crate::PendingEntry;

#[derive(Clone, Debug)]
pub struct BatchPolicy {
    /// Dispatch as soon as this many rows have accumulated.
    pub max_rows: usize,
    /// Longest a cycle waits before dispatching a partial batch.
    pub flush_interval: Duration,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            max_rows: 16,
            flush_interval: Duration::from_millis(5),
        }
    }
}

/// Entries gathered during one accumulation cycle.
#[derive(Debug, Default)]
pub struct PendingBatch {
    entries: Vec<PendingEntry>,
    merged: RowBatch,
}

impl PendingBatch {
    pub fn push(&mut self, entry: PendingEntry) {
        if self.entries.is_empty() {
            self.merged = RowBatch::new(entry.rows.width());
        }
        self.merged.append(&entry.rows);
        self.entries.push(entry);
    }

    pub fn rows(&self) -> usize {
        self.merged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.merged.is_empty()
    }

    pub fn into_job(self) -> BatchJob {
        BatchJob {
            entries: self.entries,
            merged: self.merged,
            created_at: Instant::now(),
        }
    }
}

/// A batch ready to run on a worker.
#[derive(Debug)]
pub struct BatchJob {
    pub entries: Vec<PendingEntry>,
    /// Concatenation of every entry's rows, in entry order.
    pub merged: RowBatch,
    pub created_at: Instant,
}

pub struct Batcher {
    policy: BatchPolicy,
    rx: mpsc::Receiver<PendingEntry>,
    worker_tx: mpsc::Sender<BatchJob>,
}

impl Batcher {
    pub fn new(
        policy: BatchPolicy,
        rx: mpsc::Receiver<PendingEntry>,
        worker_tx: mpsc::Sender<BatchJob>,
    ) -> Self {
        Self {
            policy,
            rx,
            worker_tx,
        }
    }

    /// Runs accumulation cycles until every submitter is gone.
    ///
    /// The deadline is fixed when a cycle starts; entries arriving later in the
    /// cycle do not extend it.
    pub async fn run(mut self) -> Result<()> {
        let mut open = true;

        while open {
            let deadline = Instant::now() + self.policy.flush_interval;
            let mut pending = PendingBatch::default();

            while pending.rows() < self.policy.max_rows {
                match timeout_at(deadline, self.rx.recv()).await {
                    Ok(Some(entry)) => pending.push(entry),
                    Ok(None) => {
                        open = false;
                        break;
                    }
                    Err(_elapsed) => break,
                }
            }

            if pending.is_empty() {
                continue;
            }
            self.dispatch(pending).await?;
        }

        debug!("batcher input closed");
        Ok(())
    }

    async fn dispatch(&self, pending: PendingBatch) -> Result<()> {
        let job = pending.into_job();
        debug!(
            entries = job.entries.len(),
            batch_rows = job.merged.len(),
            "dispatching batch"
        );

        self.worker_tx
            .send(job)
            .await
            .map_err(|_| anyhow::anyhow!("dispatch worker stopped"))
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::oneshot;
    use tokio::time::sleep;

    use super::*;

    fn entry(rows: usize, fill: f32) -> PendingEntry {
        let (resp_tx, _rx) = oneshot::channel();
        PendingEntry {
            rows: RowBatch::from_flat(3, vec![fill; rows * 3]).unwrap(),
            enqueued_at: Instant::now(),
            resp_tx,
        }
    }

    fn start(
        max_rows: usize,
        flush_ms: u64,
    ) -> (
        mpsc::Sender<PendingEntry>,
        mpsc::Receiver<BatchJob>,
        tokio::task::JoinHandle<Result<()>>,
    ) {
        let (tx, rx) = mpsc::channel(64);
        let (worker_tx, worker_rx) = mpsc::channel(64);
        let policy = BatchPolicy {
            max_rows,
            flush_interval: Duration::from_millis(flush_ms),
        };
        let handle = tokio::spawn(Batcher::new(policy, rx, worker_tx).run());
        (tx, worker_rx, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn full_batch_dispatches_before_deadline() {
        let t0 = Instant::now();
        let (tx, mut jobs, _h) = start(4, 5);

        tx.send(entry(2, 1.0)).await.unwrap();
        sleep(Duration::from_millis(1)).await;
        tx.send(entry(2, 2.0)).await.unwrap();

        let job = jobs.recv().await.unwrap();
        let waited = t0.elapsed();
        assert_eq!(job.merged.len(), 4);
        assert_eq!(job.entries.len(), 2);
        assert!(waited >= Duration::from_millis(1), "{waited:?}");
        assert!(waited < Duration::from_millis(5), "{waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn partial_batch_waits_for_flush_interval() {
        let t0 = Instant::now();
        let (tx, mut jobs, _h) = start(4, 5);

        tx.send(entry(1, 1.0)).await.unwrap();

        let job = jobs.recv().await.unwrap();
        let waited = t0.elapsed();
        assert_eq!(job.merged.len(), 1);
        assert!(waited >= Duration::from_millis(5), "{waited:?}");
        assert!(waited <= Duration::from_millis(6), "{waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn idle_cycles_never_dispatch_empty_batches() {
        let t0 = Instant::now();
        let (tx, mut jobs, _h) = start(4, 5);

        sleep(Duration::from_millis(12)).await;
        assert!(jobs.try_recv().is_err());

        tx.send(entry(1, 1.0)).await.unwrap();
        let job = jobs.recv().await.unwrap();
        let waited = t0.elapsed();
        assert_eq!(job.merged.len(), 1);
        // Arrived mid-cycle, so it rides that cycle's deadline rather than a fresh one.
        assert!(waited > Duration::from_millis(12), "{waited:?}");
        assert!(waited <= Duration::from_millis(16), "{waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_entry_is_kept_whole() {
        let (tx, mut jobs, _h) = start(4, 5);

        tx.send(entry(3, 1.0)).await.unwrap();
        tx.send(entry(3, 2.0)).await.unwrap();

        let job = jobs.recv().await.unwrap();
        assert_eq!(job.entries.len(), 2);
        assert_eq!(job.merged.len(), 6);
        assert_eq!(job.merged.row(0), Some(&[1.0, 1.0, 1.0][..]));
        assert_eq!(job.merged.row(5), Some(&[2.0, 2.0, 2.0][..]));
    }

    #[tokio::test(start_paused = true)]
    async fn closing_input_flushes_then_exits() {
        let (tx, mut jobs, handle) = start(16, 5);

        tx.send(entry(1, 1.0)).await.unwrap();
        drop(tx);

        let job = jobs.recv().await.unwrap();
        assert_eq!(job.merged.len(), 1);
        handle.await.unwrap().unwrap();
        assert!(jobs.recv().await.is_none());
    }
}
