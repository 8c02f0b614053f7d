use std::sync::Arc;

use batchport_backend_ort::OrtBackend;
use batchport_core::{Backend, ModelSession, ServeError};
use batchport_runtime::{BatchCoordinator, BatchPolicy, CoordinatorTasks, RunningStats};

use crate::cli::ModelArgs;

/// Everything a handler needs, built once at startup and cloned into each surface.
#[derive(Clone)]
pub struct ServiceContext {
    pub session: ModelSession,
    pub coordinator: BatchCoordinator,
    pub stats: Arc<RunningStats>,
}

impl ServiceContext {
    /// Spawns the coalescing path for `session` on the current runtime.
    pub fn start(session: ModelSession, policy: BatchPolicy) -> (Self, CoordinatorTasks) {
        let (coordinator, tasks) = BatchCoordinator::spawn(session.clone(), policy);
        let ctx = Self {
            session,
            coordinator,
            stats: Arc::new(RunningStats::new()),
        };
        (ctx, tasks)
    }
}

pub fn load_session(args: &ModelArgs, sessions: usize) -> Result<ModelSession, ServeError> {
    let backend = OrtBackend::with_options(args.ort_options(sessions));
    let model = backend.load(&args.model_path)?;
    Ok(ModelSession::new(model))
}
