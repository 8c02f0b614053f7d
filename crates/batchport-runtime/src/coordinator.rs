use anyhow::Result;
use batchport_core::{ModelSession, RowBatch, ServeError, ValidationError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::{BatchPolicy, BatchReply, Batcher, PendingEntry, Worker};

const QUEUE_DEPTH: usize = 1024;
const JOB_DEPTH: usize = 8;

/// Submission handle for the coalescing path. Cheap to clone.
#[derive(Clone, Debug)]
pub struct BatchCoordinator {
    tx: mpsc::Sender<PendingEntry>,
    input_features: usize,
}

/// Background tasks behind a [`BatchCoordinator`]. Both finish once every
/// handle has been dropped and the last batch has been resolved.
pub struct CoordinatorTasks {
    pub batcher: JoinHandle<Result<()>>,
    pub worker: JoinHandle<Result<()>>,
}

impl BatchCoordinator {
    /// Spawns the batcher and its dispatch worker on the current runtime.
    pub fn spawn(session: ModelSession, policy: BatchPolicy) -> (Self, CoordinatorTasks) {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let (worker_tx, worker_rx) = mpsc::channel(JOB_DEPTH);

        let input_features = session.input_features();
        let batcher = Batcher::new(policy, rx, worker_tx);
        let worker = Worker {
            id: 0,
            inbox: worker_rx,
            session,
        };

        let tasks = CoordinatorTasks {
            batcher: tokio::spawn(async move {
                let res = batcher.run().await;
                if let Err(e) = &res {
                    tracing::error!(error = ?e, "batcher exited");
                }
                res
            }),
            worker: tokio::spawn(async move {
                let res = worker.run().await;
                if let Err(e) = &res {
                    tracing::error!(error = ?e, "worker exited");
                }
                res
            }),
        };

        (
            Self {
                tx,
                input_features,
            },
            tasks,
        )
    }

    /// Queues `rows` as one entry and waits for its share of the batch result.
    pub async fn submit(&self, rows: RowBatch) -> Result<BatchReply, ServeError> {
        if rows.is_empty() {
            return Err(ValidationError::EmptyRequest.into());
        }
        if rows.width() != self.input_features {
            return Err(ValidationError::FeatureSize {
                expected: self.input_features,
                actual: rows.width(),
                item: None,
            }
            .into());
        }

        let (resp_tx, resp_rx) = oneshot::channel();
        let entry = PendingEntry {
            rows,
            enqueued_at: Instant::now(),
            resp_tx,
        };

        self.tx
            .send(entry)
            .await
            .map_err(|_| ServeError::Unavailable("batcher is not running".to_string()))?;

        resp_rx
            .await
            .map_err(|_| ServeError::Unavailable("batch dropped before completion".to_string()))?
    }
}
