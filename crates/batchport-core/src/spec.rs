/// Declared shape and provenance of a loaded model.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelSpec {
    pub input_name: String,
    pub output_name: String,
    /// Width of every input row (the last dimension of the first input).
    pub input_features: usize,
    /// Width of an output row; `None` when the graph leaves it dynamic.
    pub output_features: Option<usize>,
    /// Execution providers that activated, in preference order.
    pub providers: Vec<String>,
    pub framework: &'static str,
}

impl ModelSpec {
    /// Comma-joined provider list, as reported to clients.
    pub fn device(&self) -> String {
        self.providers.join(",")
    }
}
