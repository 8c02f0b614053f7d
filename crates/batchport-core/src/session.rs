use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::{BackendModel, ModelSpec, RowBatch, ServeError, ValidationError};

/// Output of a single physical forward pass.
#[derive(Clone, Debug)]
pub struct Inference {
    pub outputs: RowBatch,
    pub elapsed: Duration,
}

impl Inference {
    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed.as_secs_f64() * 1000.0
    }
}

/// Shared, read-only handle to the loaded model.
#[derive(Clone)]
pub struct ModelSession {
    model: Arc<dyn BackendModel>,
}

impl ModelSession {
    pub fn new<M: BackendModel>(model: M) -> Self {
        Self {
            model: Arc::new(model),
        }
    }

    pub fn spec(&self) -> &ModelSpec {
        self.model.spec()
    }

    pub fn input_features(&self) -> usize {
        self.spec().input_features
    }

    pub fn validate<R: AsRef<[f32]>>(&self, rows: &[R]) -> Result<RowBatch, ValidationError> {
        RowBatch::from_rows(rows, self.input_features())
    }

    /// Runs one forward pass over `rows` on the calling thread.
    pub fn infer(&self, rows: &RowBatch) -> Result<Inference, ServeError> {
        if rows.is_empty() {
            return Err(ValidationError::EmptyRequest.into());
        }
        if rows.width() != self.input_features() {
            return Err(ValidationError::FeatureSize {
                expected: self.input_features(),
                actual: rows.width(),
                item: None,
            }
            .into());
        }

        let start = Instant::now();
        let outputs = self
            .model
            .infer(rows)
            .map_err(|err| ServeError::backend(&err))?;
        let elapsed = start.elapsed();

        if outputs.len() != rows.len() {
            return Err(ServeError::Backend(format!(
                "model returned {} rows for {} inputs",
                outputs.len(),
                rows.len()
            )));
        }

        Ok(Inference { outputs, elapsed })
    }
}

impl fmt::Debug for ModelSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelSession")
            .field("spec", self.spec())
            .finish()
    }
}
