use batchport_core::{RowBatch, ServeError};
use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};

/// Single-assignment slot the coordinator resolves exactly once.
pub type Completion = oneshot::Sender<Result<BatchReply, ServeError>>;

#[derive(Debug)]
pub struct PendingEntry {
    pub rows: RowBatch,
    pub enqueued_at: Instant,
    pub resp_tx: Completion,
}

impl PendingEntry {
    pub fn count(&self) -> usize {
        self.rows.len()
    }
}

/// One caller's share of a physical batch.
#[derive(Debug, Clone)]
pub struct BatchReply {
    pub outputs: RowBatch,
    pub timings: Timings,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Timings {
    /// Time between enqueue and dispatch.
    pub queued: Duration,
    /// Duration of the forward pass that produced this reply.
    pub backend: Duration,
    /// Rows in the physical batch, across all callers.
    pub batch_rows: usize,
}

impl Timings {
    pub fn queued_ms(&self) -> f64 {
        self.queued.as_secs_f64() * 1000.0
    }

    pub fn backend_ms(&self) -> f64 {
        self.backend.as_secs_f64() * 1000.0
    }
}
