use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::health::HealthState;
use crate::stats::{stats_middleware, StatsLayerState};
use crate::thumbnails::ThumbnailService;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Clone)]
pub struct AppState {
    pub thumbnails: Arc<ThumbnailService>,
    pub health: Arc<HealthState>,
}

/// Full route table with the stats observer and request tracing installed.
pub fn build_router(state: AppState, stats: StatsLayerState) -> Router {
    Router::new()
        .route("/hc", get(health_check))
        .route("/health", get(health_check))
        .route("/{bucket}/{file_name}", get(get_thumbnail))
        .route("/{bucket}/{file_name}/{alias}", get(get_thumbnail_by_alias))
        .layer(middleware::from_fn_with_state(stats, stats_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn if_none_match(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

async fn get_thumbnail(
    State(state): State<AppState>,
    Path((bucket, file_name)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    state
        .thumbnails
        .get_thumbnail(&bucket, &file_name, if_none_match(&headers).as_deref())
        .await
}

async fn get_thumbnail_by_alias(
    State(state): State<AppState>,
    Path((bucket, file_name, alias)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Response {
    state
        .thumbnails
        .get_thumbnail_by_alias(&bucket, &file_name, &alias, if_none_match(&headers).as_deref())
        .await
}

async fn health_check(State(state): State<AppState>) -> Response {
    match state.health.buckets_info() {
        Some(info) => {
            let status = if info.error {
                StatusCode::INTERNAL_SERVER_ERROR
            } else {
                StatusCode::OK
            };
            (status, axum::Json(json!({"status": info, "version": VERSION}))).into_response()
        }
        None => {
            tracing::error!("Health was requested before provisioning results were published");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
