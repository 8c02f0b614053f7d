use anyhow::Result;
use batchport_core::{Inference, ModelSession, ServeError};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::{BatchJob, BatchReply, PendingEntry, Timings};

/// Runs dispatched batches against the model, one at a time.
pub struct Worker {
    pub id: u32,
    pub inbox: mpsc::Receiver<BatchJob>,
    pub session: ModelSession,
}

impl Worker {
    pub async fn run(mut self) -> Result<()> {
        info!(worker_id = self.id, "dispatch worker started");
        while let Some(job) = self.inbox.recv().await {
            self.execute(job).await;
        }
        info!(worker_id = self.id, "dispatch worker stopped");
        Ok(())
    }

    async fn execute(&self, job: BatchJob) {
        let BatchJob {
            entries,
            merged,
            created_at,
        } = job;
        let batch_rows = merged.len();
        let max_queued = entries
            .iter()
            .map(|e| created_at.saturating_duration_since(e.enqueued_at))
            .max()
            .unwrap_or_default();

        // The forward pass blocks, so it runs off the async workers.
        let session = self.session.clone();
        let result = tokio::task::spawn_blocking(move || session.infer(&merged))
            .await
            .unwrap_or_else(|err| {
                Err(ServeError::Backend(format!("inference task failed: {err}")))
            });

        match result {
            Ok(inference) => {
                debug!(
                    worker_id = self.id,
                    entries = entries.len(),
                    batch_rows,
                    max_queued_ms = max_queued.as_secs_f64() * 1000.0,
                    elapsed_ms = inference.elapsed_ms(),
                    "batch complete"
                );
                fan_out(entries, &inference, created_at);
            }
            Err(err) => {
                error!(
                    worker_id = self.id,
                    entries = entries.len(),
                    batch_rows,
                    error = %err,
                    "batch failed"
                );
                for entry in entries {
                    // A caller that went away is simply skipped.
                    let _ = entry.resp_tx.send(Err(err.clone()));
                }
            }
        }
    }
}

/// Slices one batch result back to its entries, in submission order.
fn fan_out(entries: Vec<PendingEntry>, inference: &Inference, dispatched_at: Instant) {
    let batch_rows = inference.outputs.len();
    let mut offset = 0;

    for entry in entries {
        let count = entry.count();
        let outputs = inference.outputs.slice(offset..offset + count);
        offset += count;

        let reply = BatchReply {
            outputs,
            timings: Timings {
                queued: dispatched_at.saturating_duration_since(entry.enqueued_at),
                backend: inference.elapsed,
                batch_rows,
            },
        };
        let _ = entry.resp_tx.send(Ok(reply));
    }
}
