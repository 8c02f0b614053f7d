use std::future::Future;
use std::net::SocketAddr;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use batchport_core::{Inference, RowBatch, ServeError, ValidationError};
use batchport_proto::batchport::v1 as pb;
use batchport_proto::batchport::v1::neural_service_server::NeuralServiceServer;
use tonic::{Request, Response, Status};
use tonic_reflection::server::Builder as ReflectionBuilder;
use tracing::{error, info};

use crate::context::ServiceContext;

/// How a client wants an output row read back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputKind {
    /// Full distribution plus its argmax.
    Policy,
    /// First element as a scalar.
    Value,
}

impl OutputKind {
    pub fn from_model_type(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("policy") {
            OutputKind::Policy
        } else {
            OutputKind::Value
        }
    }

    pub fn response(self, row: &[f32]) -> pb::PredictResponse {
        match self {
            OutputKind::Policy => pb::PredictResponse {
                probabilities: row.to_vec(),
                value: 0.0,
                best_move: argmax(row),
            },
            OutputKind::Value => pb::PredictResponse {
                probabilities: Vec::new(),
                value: row.first().copied().unwrap_or_default(),
                best_move: 0,
            },
        }
    }
}

/// Index of the first maximum; NaNs never win.
fn argmax(row: &[f32]) -> i32 {
    let mut best = 0;
    for (i, v) in row.iter().enumerate() {
        if *v > row[best] || row[best].is_nan() {
            best = i;
        }
    }
    i32::try_from(best).unwrap_or(i32::MAX)
}

pub struct NeuralSvc {
    ctx: ServiceContext,
}

impl NeuralSvc {
    pub fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }

    /// Runs on the calling RPC worker thread; each call is its own batch.
    fn run(&self, rows: &RowBatch) -> std::result::Result<Inference, Status> {
        self.ctx.session.infer(rows).map_err(to_status)
    }
}

fn to_status(err: ServeError) -> Status {
    match err {
        ServeError::Validation(e) => Status::invalid_argument(e.to_string()),
        ServeError::Unavailable(msg) => Status::unavailable(msg),
        other => {
            error!(error = %other, "rpc inference failed");
            Status::internal(other.to_string())
        }
    }
}

fn invalid_argument(err: ValidationError) -> Status {
    Status::invalid_argument(err.to_string())
}

#[tonic::async_trait]
impl pb::neural_service_server::NeuralService for NeuralSvc {
    async fn predict(
        &self,
        req: Request<pb::PredictRequest>,
    ) -> std::result::Result<Response<pb::PredictResponse>, Status> {
        let req = req.into_inner();
        if req.features.is_empty() {
            return Err(Status::invalid_argument("empty features provided"));
        }

        let rows = self
            .ctx
            .session
            .validate(&[req.features.as_slice()])
            .map_err(invalid_argument)?;
        let inference = self.run(&rows)?;
        self.ctx.stats.record(1, inference.elapsed);

        let kind = OutputKind::from_model_type(&req.model_type);
        let row = inference.outputs.row(0).unwrap_or_default();
        Ok(Response::new(kind.response(row)))
    }

    async fn batch_predict(
        &self,
        req: Request<pb::BatchPredictRequest>,
    ) -> std::result::Result<Response<pb::BatchPredictResponse>, Status> {
        let req = req.into_inner();
        let features: Vec<&[f32]> = req.inputs.iter().map(|i| i.features.as_slice()).collect();

        let rows = self
            .ctx
            .session
            .validate(&features)
            .map_err(invalid_argument)?;
        let inference = self.run(&rows)?;
        self.ctx.stats.record(rows.len(), inference.elapsed);

        let kind = OutputKind::from_model_type(&req.model_type);
        let outputs = inference.outputs.iter().map(|row| kind.response(row)).collect();
        Ok(Response::new(pb::BatchPredictResponse { outputs }))
    }

    async fn get_model_info(
        &self,
        _req: Request<pb::ModelInfoRequest>,
    ) -> std::result::Result<Response<pb::ModelInfoResponse>, Status> {
        let spec = self.ctx.session.spec();
        let info = pb::ModelInfoResponse {
            input_size: i32::try_from(spec.input_features).unwrap_or(-1),
            hidden_size: -1,
            output_size: spec
                .output_features
                .and_then(|n| i32::try_from(n).ok())
                .unwrap_or(-1),
            device: spec.device(),
            framework: spec.framework.to_string(),
        };
        info!(
            input_size = info.input_size,
            output_size = info.output_size,
            device = %info.device,
            "model info requested"
        );
        Ok(Response::new(info))
    }
}

/// Serves gRPC on its own runtime with exactly `workers` threads, so that
/// forward passes run in parallel without starving the HTTP side.
pub fn spawn_rpc_server<F>(
    ctx: ServiceContext,
    addr: SocketAddr,
    workers: usize,
    shutdown: F,
) -> Result<JoinHandle<Result<()>>>
where
    F: Future<Output = ()> + Send + 'static,
{
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .thread_name("rpc-worker")
        .enable_all()
        .build()
        .context("failed to build RPC runtime")?;

    std::thread::Builder::new()
        .name("rpc-server".to_string())
        .spawn(move || runtime.block_on(serve_rpc(ctx, addr, workers, shutdown)))
        .context("failed to spawn RPC server thread")
}

async fn serve_rpc<F>(ctx: ServiceContext, addr: SocketAddr, workers: usize, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let reflection = ReflectionBuilder::configure()
        .register_encoded_file_descriptor_set(batchport_proto::FILE_DESCRIPTOR_SET)
        .build_v1()
        .map_err(|e| anyhow::anyhow!("reflection build failed: {e}"))?;

    info!(%addr, workers, "batchportd gRPC listening");
    tonic::transport::Server::builder()
        .add_service(NeuralServiceServer::new(NeuralSvc::new(ctx)))
        .add_service(reflection)
        .serve_with_shutdown(addr, shutdown)
        .await
        .context("gRPC server failed")
}
