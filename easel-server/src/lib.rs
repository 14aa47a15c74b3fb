use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use easel_core::{encode_png, GenerationRequest, Pipeline, ValidationError};
use serde::Serialize;
use tokio::task;
use tower_http::trace::TraceLayer;

pub const WELCOME_MESSAGE: &str =
    "Welcome to the image generation API. Use the /generate-image/ endpoint to generate images.";

/// Fixed user-facing message for generation failures. The underlying error
/// goes to the log, never to the caller.
pub const GENERATION_ERROR_DETAIL: &str = "An error occurred while generating the image.";

// Application state containing the preloaded pipeline.
pub struct AppState {
    pub pipeline: Arc<dyn Pipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<dyn Pipeline>) -> Self {
        Self { pipeline }
    }
}

#[derive(Serialize)]
struct WelcomeResponse {
    message: &'static str,
}

#[derive(Serialize)]
struct ErrorResponse {
    detail: String,
}

#[derive(Debug)]
pub enum ApiError {
    Validation(ValidationError),
    Generation,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            ApiError::Validation(err) => (StatusCode::UNPROCESSABLE_ENTITY, err.to_string()),
            ApiError::Generation => (
                StatusCode::INTERNAL_SERVER_ERROR,
                GENERATION_ERROR_DETAIL.to_string(),
            ),
        };
        (status, Json(ErrorResponse { detail })).into_response()
    }
}

async fn root() -> Json<WelcomeResponse> {
    Json(WelcomeResponse {
        message: WELCOME_MESSAGE,
    })
}

async fn generate_image_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<GenerationRequest>,
) -> Result<Response, ApiError> {
    tracing::info!("Received request: {:?}", request);
    request.validate().map_err(ApiError::Validation)?;

    // Generation is a long blocking computation, keep it off the async workers.
    let pipeline = Arc::clone(&state.pipeline);
    let png = task::spawn_blocking(move || -> anyhow::Result<Vec<u8>> {
        let image = pipeline.generate(&request)?;
        encode_png(&image)
    })
    .await
    .map_err(|e| {
        tracing::error!("Generation task aborted: {e}");
        ApiError::Generation
    })?
    .map_err(|e| {
        tracing::error!("Error generating image: {e:?}");
        ApiError::Generation
    })?;

    tracing::info!("Image generated successfully");
    Ok(([(header::CONTENT_TYPE, "image/png")], png).into_response())
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/generate-image/", post(generate_image_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
