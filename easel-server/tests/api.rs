//! Endpoint tests driving the router directly with a stub pipeline, so no
//! model weights are needed.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use easel_core::{GenerationRequest, Pipeline};
use easel_server::{create_router, AppState, GENERATION_ERROR_DETAIL, WELCOME_MESSAGE};
use image::{DynamicImage, ImageBuffer, Rgb};
use serde_json::Value;
use tower::util::ServiceExt;

const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";

/// Deterministic stand-in for the diffusion pipeline: the output image is a
/// pure function of the request fields.
#[derive(Default)]
struct StubPipeline {
    calls: AtomicUsize,
    failure: Option<&'static str>,
    last_request: Mutex<Option<GenerationRequest>>,
}

impl StubPipeline {
    fn failing(message: &'static str) -> Self {
        Self {
            failure: Some(message),
            ..Self::default()
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Pipeline for StubPipeline {
    fn generate(&self, request: &GenerationRequest) -> anyhow::Result<DynamicImage> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(request.clone());
        if let Some(message) = self.failure {
            anyhow::bail!("{message}");
        }
        let seed = request.seed;
        let steps = request.num_inference_steps as u8;
        let buffer = ImageBuffer::from_fn(8, 8, |x, y| {
            Rgb([(seed as u8).wrapping_add(x as u8), y as u8, steps])
        });
        Ok(DynamicImage::ImageRgb8(buffer))
    }
}

fn app(stub: Arc<StubPipeline>) -> Router {
    create_router(Arc::new(AppState::new(stub)))
}

async fn post_generate(app: Router, body: &str) -> axum::response::Response {
    let request = Request::builder()
        .method(Method::POST)
        .uri("/generate-image/")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    app.oneshot(request).await.unwrap()
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

#[tokio::test]
async fn valid_request_returns_png() {
    let stub = Arc::new(StubPipeline::default());
    let response = post_generate(app(stub.clone()), r#"{"prompt": "a lighthouse at dusk"}"#).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "image/png"
    );
    let body = body_bytes(response).await;
    assert!(!body.is_empty());
    assert_eq!(&body[..8], PNG_SIGNATURE);
    assert_eq!(stub.calls(), 1);
}

#[tokio::test]
async fn empty_prompt_is_rejected_before_generation() {
    let stub = Arc::new(StubPipeline::default());
    let response = post_generate(app(stub.clone()), r#"{"prompt": ""}"#).await;

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert!(body["detail"].as_str().unwrap().contains("prompt"));
    assert_eq!(stub.calls(), 0);
}

#[tokio::test]
async fn overlong_prompt_is_rejected_before_generation() {
    let stub = Arc::new(StubPipeline::default());
    let prompt = "x".repeat(1025);
    let body = format!(r#"{{"prompt": "{prompt}"}}"#);
    let response = post_generate(app(stub.clone()), &body).await;

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(stub.calls(), 0);
}

#[tokio::test]
async fn missing_prompt_is_a_schema_violation() {
    let stub = Arc::new(StubPipeline::default());
    let response = post_generate(app(stub.clone()), r#"{"seed": 7}"#).await;

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(stub.calls(), 0);
}

#[tokio::test]
async fn identical_requests_produce_identical_bytes() {
    let stub = Arc::new(StubPipeline::default());
    let app = app(stub);
    let body = r#"{"prompt": "a red bicycle", "seed": 1234}"#;

    let first = body_bytes(post_generate(app.clone(), body).await).await;
    let second = body_bytes(post_generate(app.clone(), body).await).await;
    assert_eq!(first, second);

    let other_seed = r#"{"prompt": "a red bicycle", "seed": 1235}"#;
    let third = body_bytes(post_generate(app, other_seed).await).await;
    assert_ne!(first, third);
}

#[tokio::test]
async fn generation_failure_returns_opaque_500() {
    let stub = Arc::new(StubPipeline::failing("tensor shape mismatch in denoise"));
    let response = post_generate(app(stub), r#"{"prompt": "a lighthouse"}"#).await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_bytes(response).await;
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["detail"], GENERATION_ERROR_DETAIL);
    // The internal failure detail must not leak to the caller.
    assert!(!String::from_utf8_lossy(&body).contains("tensor shape mismatch"));
}

#[tokio::test]
async fn root_returns_welcome_message() {
    // Even a broken pipeline must not affect the health endpoint.
    let stub = Arc::new(StubPipeline::failing("weights missing"));
    let request = Request::builder()
        .method(Method::GET)
        .uri("/")
        .body(Body::empty())
        .unwrap();
    let response = app(stub).oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(json["message"], WELCOME_MESSAGE);
}

#[tokio::test]
async fn omitted_fields_reach_the_pipeline_as_defaults() {
    let stub = Arc::new(StubPipeline::default());
    let response = post_generate(app(stub.clone()), r#"{"prompt": "plain"}"#).await;
    assert_eq!(response.status(), StatusCode::OK);

    let seen = stub.last_request.lock().unwrap().clone().unwrap();
    assert_eq!(seen.guidance_scale, 0.0);
    assert_eq!(seen.num_inference_steps, 4);
    assert_eq!(seen.max_sequence_length, 256);
    assert_eq!(seen.seed, 0);
}
