use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use batchport_core::{ServeError, ValidationError};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::context::ServiceContext;

#[derive(Debug, Deserialize, Serialize)]
pub struct InferenceRequest {
    pub inputs: Vec<Vec<f32>>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct InferenceResponse {
    pub outputs: Vec<Vec<f32>>,
    /// Duration of the physical batch that produced `outputs`.
    pub duration_ms: f64,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ModelInfo {
    pub input_size: usize,
    pub output_size: Option<usize>,
    pub device: String,
    pub framework: String,
}

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

pub fn router(ctx: ServiceContext) -> Router {
    Router::new()
        .route("/infer", post(infer))
        .route("/infer_batch", post(infer_batch))
        .route("/health", get(health))
        .route("/model_info", get(model_info))
        .with_state(ctx)
}

/// Runs the caller's rows as their own batch, skipping the coordinator.
async fn infer(
    State(ctx): State<ServiceContext>,
    body: Result<Json<InferenceRequest>, JsonRejection>,
) -> Result<Json<InferenceResponse>, ApiError> {
    let Json(req) = body?;
    let rows = ctx.session.validate(&req.inputs)?;

    let session = ctx.session.clone();
    let inference = tokio::task::spawn_blocking(move || session.infer(&rows))
        .await
        .map_err(|err| ServeError::Backend(format!("inference task failed: {err}")))??;

    ctx.stats.record(inference.outputs.len(), inference.elapsed);
    debug!(
        batch_size = inference.outputs.len(),
        elapsed_ms = inference.elapsed_ms(),
        "direct inference"
    );

    Ok(Json(InferenceResponse {
        outputs: inference.outputs.to_vecs(),
        duration_ms: inference.elapsed_ms(),
    }))
}

/// Queues the caller's rows for coalescing with concurrent requests.
async fn infer_batch(
    State(ctx): State<ServiceContext>,
    body: Result<Json<InferenceRequest>, JsonRejection>,
) -> Result<Json<InferenceResponse>, ApiError> {
    let Json(req) = body?;
    let rows = ctx.session.validate(&req.inputs)?;
    let reply = ctx.coordinator.submit(rows).await?;

    ctx.stats.record(reply.outputs.len(), reply.timings.backend);
    debug!(
        batch_rows = reply.timings.batch_rows,
        queued_ms = reply.timings.queued_ms(),
        elapsed_ms = reply.timings.backend_ms(),
        "queued inference"
    );

    Ok(Json(InferenceResponse {
        outputs: reply.outputs.to_vecs(),
        duration_ms: reply.timings.backend_ms(),
    }))
}

async fn health() -> Json<Health> {
    Json(Health { status: "ok" })
}

async fn model_info(State(ctx): State<ServiceContext>) -> Json<ModelInfo> {
    let spec = ctx.session.spec();
    Json(ModelInfo {
        input_size: spec.input_features,
        output_size: spec.output_features,
        device: spec.device(),
        framework: spec.framework.to_string(),
    })
}

pub enum ApiError {
    Serve(ServeError),
    /// The body was not a well-formed `InferenceRequest`.
    Body(JsonRejection),
}

impl From<ServeError> for ApiError {
    fn from(err: ServeError) -> Self {
        Self::Serve(err)
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        Self::Serve(err.into())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::Body(rejection)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Body(rejection) => (StatusCode::BAD_REQUEST, rejection.body_text()),
            ApiError::Serve(err) => {
                let status = match &err {
                    ServeError::Validation(_) => StatusCode::BAD_REQUEST,
                    ServeError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                    ServeError::Backend(_) | ServeError::ModelLoad(_) => {
                        error!(error = %err, "inference request failed");
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                (status, err.to_string())
            }
        };
        (status, Json(ErrorBody { error: message })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use batchport_runtime::BatchPolicy;
    use serde::de::DeserializeOwned;
    use tower::ServiceExt;

    use super::*;
    use crate::context::testing::echo_context;

    fn policy(max_rows: usize, flush_ms: u64) -> BatchPolicy {
        BatchPolicy {
            max_rows,
            flush_interval: Duration::from_millis(flush_ms),
        }
    }

    async fn post<T: DeserializeOwned>(
        app: Router,
        uri: &str,
        body: serde_json::Value,
    ) -> (StatusCode, T) {
        let req = Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn direct_infer_returns_rows_in_order() {
        let ctx = echo_context(3, policy(16, 5));
        let app = router(ctx.clone());

        let (status, body): (_, InferenceResponse) = post(
            app,
            "/infer",
            serde_json::json!({ "inputs": [[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]] }),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.outputs, vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]]);
        assert!(body.duration_ms >= 0.0);
        assert_eq!(ctx.stats.report().unwrap().total_items, 2);
    }

    #[tokio::test]
    async fn queued_requests_are_coalesced() {
        let ctx = echo_context(3, policy(4, 200));
        let app = router(ctx.clone());

        let first = post::<InferenceResponse>(
            app.clone(),
            "/infer_batch",
            serde_json::json!({ "inputs": [[1.0, 1.0, 1.0], [2.0, 2.0, 2.0]] }),
        );
        let second = post::<InferenceResponse>(
            app,
            "/infer_batch",
            serde_json::json!({ "inputs": [[3.0, 3.0, 3.0], [4.0, 4.0, 4.0]] }),
        );
        let ((s1, a), (s2, b)) = tokio::join!(first, second);

        assert_eq!(s1, StatusCode::OK);
        assert_eq!(s2, StatusCode::OK);
        assert_eq!(a.outputs, vec![vec![1.0; 3], vec![2.0; 3]]);
        assert_eq!(b.outputs, vec![vec![3.0; 3], vec![4.0; 3]]);
        // Both callers report the duration of the same physical batch.
        assert_eq!(a.duration_ms, b.duration_ms);
        assert_eq!(ctx.stats.report().unwrap().total_requests, 2);
    }

    #[tokio::test]
    async fn wrong_feature_count_is_a_bad_request() {
        let ctx = echo_context(3, policy(16, 5));

        for uri in ["/infer", "/infer_batch"] {
            let (status, body): (_, ErrorBody) = post(
                router(ctx.clone()),
                uri,
                serde_json::json!({ "inputs": [[1.0, 2.0]] }),
            )
            .await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert!(body.error.contains("expected 3, got 2"), "{}", body.error);
        }
        assert!(ctx.stats.report().is_none());
    }

    #[tokio::test]
    async fn empty_inputs_are_a_bad_request() {
        let ctx = echo_context(3, policy(16, 5));
        let (status, _body): (_, ErrorBody) =
            post(router(ctx), "/infer", serde_json::json!({ "inputs": [] })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn malformed_body_gets_a_json_error() {
        let ctx = echo_context(3, policy(16, 5));

        for body in [
            serde_json::json!({ "inputs": "x" }),
            serde_json::json!({ "rows": [[1.0, 2.0, 3.0]] }),
        ] {
            for uri in ["/infer", "/infer_batch"] {
                let (status, err): (_, ErrorBody) =
                    post(router(ctx.clone()), uri, body.clone()).await;
                assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
                assert!(!err.error.is_empty());
            }
        }

        let req = Request::post("/infer")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let resp = router(ctx.clone()).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let err: ErrorBody = serde_json::from_slice(&bytes).unwrap();
        assert!(!err.error.is_empty());
        assert!(ctx.stats.report().is_none());
    }

    #[tokio::test]
    async fn backend_failure_is_an_internal_error() {
        let ctx = echo_context(1, policy(16, 5));
        let (status, body): (_, ErrorBody) = post(
            router(ctx),
            "/infer",
            serde_json::json!({ "inputs": [[-1.0]] }),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.error.contains("negative feature"), "{}", body.error);
    }

    #[tokio::test]
    async fn queued_failure_fails_every_request_in_the_batch() {
        let ctx = echo_context(1, policy(3, 200));
        let app = router(ctx.clone());

        let poisoned = post::<ErrorBody>(
            app.clone(),
            "/infer_batch",
            serde_json::json!({ "inputs": [[-1.0]] }),
        );
        let healthy = post::<ErrorBody>(
            app.clone(),
            "/infer_batch",
            serde_json::json!({ "inputs": [[1.0], [2.0]] }),
        );
        let ((s1, a), (s2, b)) = tokio::join!(poisoned, healthy);
        assert_eq!(s1, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(s2, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(a.error, b.error);

        let (status, body): (_, InferenceResponse) = post(
            app,
            "/infer_batch",
            serde_json::json!({ "inputs": [[5.0]] }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.outputs, vec![vec![5.0]]);
    }

    #[tokio::test]
    async fn model_info_reports_declared_sizes() {
        let ctx = echo_context(81, policy(16, 5));
        let req = Request::get("/model_info").body(Body::empty()).unwrap();
        let resp = router(ctx).oneshot(req).await.unwrap();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let info: ModelInfo = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(info.input_size, 81);
        assert_eq!(info.output_size, Some(81));
        assert_eq!(info.device, "CPUExecutionProvider");
        assert_eq!(info.framework, "test");
    }
}
