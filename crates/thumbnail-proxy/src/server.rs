//! HTTP server for thumbnail endpoints
//!
//! Provides /health and /thumb?url=<locator>.

use crate::types::{HealthResponse, ThumbQuery};
use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use image::{DynamicImage, ImageFormat};
use serde::Serialize;
use std::io::Cursor;
use std::sync::Arc;
use thumbnail_cache::ImageCacheService;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

/// Shared state for the HTTP server
pub struct ServerState {
    pub cache: ImageCacheService,
    pub started_at: DateTime<Utc>,
}

impl ServerState {
    pub fn new(cache: ImageCacheService) -> Self {
        Self {
            cache,
            started_at: Utc::now(),
        }
    }
}

pub type SharedState = Arc<ServerState>;

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
        .into_response()
}

/// Create the HTTP router
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/thumb", get(get_thumb))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server, returning once `shutdown` resolves
pub async fn start_server(
    state: SharedState,
    port: u16,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let router = create_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}

/// Health check endpoint
async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    let uptime_secs = (Utc::now() - state.started_at).num_seconds() as u64;

    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs,
        cache: state.cache.stats(),
        disk: state.cache.disk_stats().await,
    })
}

/// Get a thumbnail by locator, re-encoded as PNG
async fn get_thumb(State(state): State<SharedState>, Query(query): Query<ThumbQuery>) -> Response {
    let locator = query.url.trim();
    if locator.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Missing image url");
    }

    // Failures were already logged by the cache; the client shows a placeholder
    let Some(cached) = state.cache.get_image(locator).await else {
        return error_response(StatusCode::NOT_FOUND, "Image not available");
    };

    let png = match encode_png(&cached.image) {
        Ok(png) => png,
        Err(e) => {
            error!(key = %cached.key, error = %e, "Failed to encode thumbnail");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode image");
        }
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "image/png")
        .header(header::CACHE_CONTROL, "public, max-age=86400")
        .header("X-Cache", cached.source.as_str())
        .body(Body::from(png))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn encode_png(image: &DynamicImage) -> image::ImageResult<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    image.write_to(&mut out, ImageFormat::Png)?;
    Ok(out.into_inner())
}
