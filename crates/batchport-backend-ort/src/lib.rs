mod pool;

use std::path::Path;
use std::str::FromStr;

use anyhow::{bail, ensure, Context, Result};
use batchport_core::{Backend, BackendModel, ModelSpec, RowBatch, ServeError};
use ort::{
    execution_providers::{CPUExecutionProvider, ExecutionProviderDispatch},
    session::{builder::GraphOptimizationLevel, Session, SessionInputValue},
    tensor::TensorElementType,
    value::ValueType,
};
use tracing::{debug, info};

pub use pool::SessionPool;

pub const FRAMEWORK: &str = "onnxruntime";

/// Execution providers the backend knows how to request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Provider {
    CoreMl,
    Cuda { device_id: u32 },
    Cpu,
}

impl Provider {
    pub fn name(&self) -> &'static str {
        match self {
            Provider::CoreMl => "CoreMLExecutionProvider",
            Provider::Cuda { .. } => "CUDAExecutionProvider",
            Provider::Cpu => "CPUExecutionProvider",
        }
    }
}

impl FromStr for Provider {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("cpu") {
            return Ok(Provider::Cpu);
        }
        if raw.eq_ignore_ascii_case("coreml") {
            return Ok(Provider::CoreMl);
        }
        if raw.eq_ignore_ascii_case("cuda") {
            return Ok(Provider::Cuda { device_id: 0 });
        }
        if let Some(rest) = raw.strip_prefix("cuda:") {
            let device_id: u32 = rest.parse().context("invalid cuda device id")?;
            return Ok(Provider::Cuda { device_id });
        }

        bail!("unsupported provider: {raw} (expected coreml, cuda, cuda:N or cpu)");
    }
}

#[derive(Clone, Debug)]
pub struct OrtOptions {
    /// Accelerated providers to try, in order. CPU is always appended.
    pub preferred: Vec<Provider>,
    /// Independent sessions to keep; bounds how many forward passes run at once.
    pub sessions: usize,
}

impl Default for OrtOptions {
    fn default() -> Self {
        Self {
            preferred: vec![Provider::CoreMl, Provider::Cuda { device_id: 0 }],
            sessions: 1,
        }
    }
}

pub struct OrtBackend {
    options: OrtOptions,
}

impl OrtBackend {
    pub fn new() -> Self {
        Self::with_options(OrtOptions::default())
    }

    pub fn with_options(options: OrtOptions) -> Self {
        Self { options }
    }
}

impl Default for OrtBackend {
    fn default() -> Self {
        Self::new()
    }
}

pub struct OrtModel {
    spec: ModelSpec,
    sessions: SessionPool<Session>,
}

impl Backend for OrtBackend {
    type Model = OrtModel;

    fn name(&self) -> &'static str {
        FRAMEWORK
    }

    fn load(&self, path: &Path) -> std::result::Result<Self::Model, ServeError> {
        load_model(path, &self.options).map_err(|err| ServeError::model_load(&err))
    }
}

impl BackendModel for OrtModel {
    fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    fn infer(&self, rows: &RowBatch) -> Result<RowBatch> {
        let shape = vec![rows.len(), rows.width()];
        let input = ort::value::Tensor::from_array((shape, rows.as_slice().to_vec()))
            .context("failed to build input tensor")?;
        let inputs = vec![(
            self.spec.input_name.clone(),
            SessionInputValue::from(input.into_dyn()),
        )];

        // Sessions need exclusive access to run.
        let (_slot, mut session) = self.sessions.acquire()?;

        let outputs = session.run(inputs).context("session run failed")?;
        let (_, value) = outputs
            .iter()
            .find(|(name, _)| *name == self.spec.output_name)
            .context("model produced no output")?;
        let (out_shape, data) = value
            .try_extract_tensor::<f32>()
            .context("output is not an f32 tensor")?;

        let width = if out_shape.len() <= 1 {
            1
        } else {
            out_shape[1..].iter().product::<i64>().max(0) as usize
        };
        RowBatch::from_flat(width, data.to_vec())
            .with_context(|| format!("output shape {out_shape:?} does not split into rows"))
    }
}

fn load_model(path: &Path, options: &OrtOptions) -> Result<OrtModel> {
    ensure!(path.is_file(), "model file not found: {}", path.display());

    let providers = select_providers(&options.preferred);
    let slots = options.sessions.max(1);
    let mut sessions = Vec::with_capacity(slots);
    for _ in 0..slots {
        sessions.push(build_session(path, &providers)?);
    }

    let spec = build_model_spec(&sessions[0], &providers)?;
    info!(
        path = %path.display(),
        input = %spec.input_name,
        input_features = spec.input_features,
        output = %spec.output_name,
        output_features = ?spec.output_features,
        providers = %spec.device(),
        sessions = slots,
        "loaded ONNX model"
    );

    Ok(OrtModel {
        spec,
        sessions: SessionPool::new(sessions),
    })
}

fn build_session(path: &Path, providers: &[Provider]) -> Result<Session> {
    let dispatch = providers
        .iter()
        .map(|p| provider_dispatch(*p))
        .collect::<Result<Vec<_>>>()?;

    Session::builder()
        .context("failed to create ORT session builder")?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .context("failed to configure ORT session builder")?
        .with_execution_providers(dispatch)
        .context("failed to register execution providers")?
        .commit_from_file(path)
        .context("failed to load ONNX model")
}

fn build_model_spec(session: &Session, providers: &[Provider]) -> Result<ModelSpec> {
    let input = session.inputs.first().context("model declares no inputs")?;
    let output = session.outputs.first().context("model declares no outputs")?;

    let ValueType::Tensor { ty, shape, .. } = &input.input_type else {
        bail!("input {} is not a tensor", input.name);
    };
    ensure!(
        *ty == TensorElementType::Float32,
        "input {} must be f32, found {ty}",
        input.name
    );
    let input_features = match shape.last() {
        Some(&d) if d > 0 => d as usize,
        _ => bail!("invalid feature size in model input shape: {shape:?}"),
    };

    let output_features = match &output.output_type {
        ValueType::Tensor { shape, .. } => shape
            .iter()
            .rev()
            .find(|d| **d > 0)
            .map(|d| *d as usize),
        _ => bail!("output {} is not a tensor", output.name),
    };

    Ok(ModelSpec {
        input_name: input.name.clone(),
        output_name: output.name.clone(),
        input_features,
        output_features,
        providers: providers.iter().map(|p| p.name().to_string()).collect(),
        framework: FRAMEWORK,
    })
}

/// Keeps the available preferred providers, in order, then CPU.
pub fn select_providers(preferred: &[Provider]) -> Vec<Provider> {
    let mut active = Vec::with_capacity(preferred.len() + 1);
    for &provider in preferred {
        if provider == Provider::Cpu || active.contains(&provider) {
            continue;
        }
        if provider_available(provider) {
            active.push(provider);
        } else {
            debug!(provider = provider.name(), "execution provider unavailable");
        }
    }
    active.push(Provider::Cpu);
    active
}

fn provider_available(provider: Provider) -> bool {
    match provider {
        Provider::Cpu => true,
        Provider::CoreMl => coreml_available(),
        Provider::Cuda { .. } => cuda_available(),
    }
}

fn provider_dispatch(provider: Provider) -> Result<ExecutionProviderDispatch> {
    match provider {
        Provider::Cpu => Ok(CPUExecutionProvider::default().build()),
        Provider::CoreMl => coreml_dispatch(),
        Provider::Cuda { device_id } => cuda_dispatch(device_id),
    }
}

#[cfg(feature = "coreml")]
fn coreml_available() -> bool {
    use ort::execution_providers::{CoreMLExecutionProvider, ExecutionProvider};
    CoreMLExecutionProvider::default()
        .is_available()
        .unwrap_or(false)
}

#[cfg(not(feature = "coreml"))]
fn coreml_available() -> bool {
    false
}

fn coreml_dispatch() -> Result<ExecutionProviderDispatch> {
    #[cfg(feature = "coreml")]
    {
        use ort::execution_providers::CoreMLExecutionProvider;
        Ok(CoreMLExecutionProvider::default().build())
    }
    #[cfg(not(feature = "coreml"))]
    {
        bail!("CoreML requested but batchport-backend-ort was built without the `coreml` feature")
    }
}

#[cfg(feature = "cuda")]
fn cuda_available() -> bool {
    use ort::execution_providers::{CUDAExecutionProvider, ExecutionProvider};
    CUDAExecutionProvider::default()
        .is_available()
        .unwrap_or(false)
}

#[cfg(not(feature = "cuda"))]
fn cuda_available() -> bool {
    false
}

fn cuda_dispatch(device_id: u32) -> Result<ExecutionProviderDispatch> {
    #[cfg(feature = "cuda")]
    {
        use ort::execution_providers::CUDAExecutionProvider;
        Ok(CUDAExecutionProvider::default()
            .with_device_id(device_id as i32)
            .build())
    }
    #[cfg(not(feature = "cuda"))]
    {
        let _ = device_id;
        bail!("CUDA requested but batchport-backend-ort was built without the `cuda` feature")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_provider_names() {
        assert_eq!("cpu".parse::<Provider>().unwrap(), Provider::Cpu);
        assert_eq!("CoreML".parse::<Provider>().unwrap(), Provider::CoreMl);
        assert_eq!(
            "cuda".parse::<Provider>().unwrap(),
            Provider::Cuda { device_id: 0 }
        );
        assert_eq!(
            "cuda:2".parse::<Provider>().unwrap(),
            Provider::Cuda { device_id: 2 }
        );
        assert!("tpu".parse::<Provider>().is_err());
        assert!("cuda:x".parse::<Provider>().is_err());
    }

    #[test]
    fn cpu_is_always_last() {
        let active = select_providers(&[Provider::Cpu, Provider::Cpu]);
        assert_eq!(active, vec![Provider::Cpu]);
    }

    #[cfg(not(any(feature = "cuda", feature = "coreml")))]
    #[test]
    fn unavailable_accelerators_are_skipped() {
        let active = select_providers(&OrtOptions::default().preferred);
        assert_eq!(active, vec![Provider::Cpu]);
    }
}
