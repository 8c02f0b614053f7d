use std::path::Path;

use anyhow::Result;

use crate::{ModelSpec, RowBatch, ServeError};

pub trait Backend: Send + Sync + 'static {
    type Model: BackendModel;

    fn name(&self) -> &'static str;
    fn load(&self, path: &Path) -> std::result::Result<Self::Model, ServeError>;
}

/// A loaded model. Must tolerate concurrent `infer` calls from many threads.
pub trait BackendModel: Send + Sync + 'static {
    fn spec(&self) -> &ModelSpec;

    /// Rows have already been validated against `spec().input_features`.
    /// Returns one output row per input row, in order.
    fn infer(&self, rows: &RowBatch) -> Result<RowBatch>;
}
