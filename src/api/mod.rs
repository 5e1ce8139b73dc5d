//! HTTP surface: liveness, metrics scrape and card preview.

use std::sync::Arc;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;

use crate::cards::{CardBuilder, CardError};
use crate::kv::Kv;
use crate::metrics;
use crate::sched;

pub struct ApiState {
    pub kv: Kv,
    pub builder: CardBuilder,
}

pub enum ApiError {
    NotFound(String),
    Validation(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, reason) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Validation(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, axum::Json(json!({ "reason": reason }))).into_response()
    }
}

impl From<CardError> for ApiError {
    fn from(err: CardError) -> ApiError {
        match err {
            CardError::InvalidEventKey => ApiError::Validation("invalid_event_key".to_string()),
            CardError::NotFound => ApiError::NotFound("event not found".to_string()),
            CardError::NoUsableSources => ApiError::Unavailable("no_usable_sources".to_string()),
            CardError::Schema(msg) => ApiError::Internal(msg),
            CardError::Other(e) => ApiError::Internal(format!("{e:#}")),
        }
    }
}

pub async fn serve(host: &str, port: u16, state: Arc<ApiState>) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_text))
        .route("/cards/preview", get(preview_card))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("{host}:{port}");
    tracing::info!(stage = "api.serve", addr = %addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn healthz(State(state): State<Arc<ApiState>>) -> Response {
    let beat_ok = sched::beat_healthy(&state.kv).await;
    let body = json!({ "ok": beat_ok, "beat": beat_ok });
    if beat_ok {
        (StatusCode::OK, axum::Json(body)).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, axum::Json(body)).into_response()
    }
}

async fn metrics_text() -> Response {
    if !crate::envcfg::env_bool("METRICS_EXPOSED", true) {
        return StatusCode::NOT_FOUND.into_response();
    }
    (
        StatusCode::OK,
        [("Content-Type", "text/plain; version=0.0.4")],
        metrics::export_text(),
    )
        .into_response()
}

#[derive(Deserialize)]
struct PreviewParams {
    event_key: String,
    #[serde(default)]
    render: bool,
}

async fn preview_card(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<PreviewParams>,
) -> Result<Response, ApiError> {
    let card = state
        .builder
        .build_card(&params.event_key, params.render)
        .await?;
    Ok(axum::Json(card).into_response())
}
