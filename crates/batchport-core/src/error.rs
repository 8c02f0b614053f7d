use thiserror::Error;

/// Input rejected before it reaches a batch or the model.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("empty request: at least one feature vector is required")]
    EmptyRequest,

    #[error(
        "incorrect number of features{}: expected {expected}, got {actual}",
        item_label(.item)
    )]
    FeatureSize {
        expected: usize,
        actual: usize,
        /// Position of the offending row when the request carried several.
        item: Option<usize>,
    },
}

fn item_label(item: &Option<usize>) -> String {
    match item {
        Some(i) => format!(" for item {i}"),
        None => String::new(),
    }
}

/// Errors surfaced by the serving layer.
///
/// `Clone` so a single backend failure can be delivered to every caller
/// that shared the failed batch.
#[derive(Debug, Clone, Error)]
pub enum ServeError {
    #[error("failed to load model: {0}")]
    ModelLoad(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("inference failed: {0}")]
    Backend(String),

    #[error("batch coordinator unavailable: {0}")]
    Unavailable(String),
}

impl ServeError {
    pub fn model_load(err: &anyhow::Error) -> Self {
        Self::ModelLoad(format!("{err:#}"))
    }

    pub fn backend(err: &anyhow::Error) -> Self {
        Self::Backend(format!("{err:#}"))
    }
}
