use crate::metrics::Metrics;
use crate::state::{CheckState, CheckStateStore, StateStatus};
use axum::body::Body;
use axum::extract::State;
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub check_store: Arc<CheckStateStore>,
    pub host: String,
    pub min_consecutive: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiCheck {
    pub check_id: String,
    pub reported: bool,
    #[serde(flatten)]
    pub state: CheckState,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiChecks {
    pub host: String,
    pub last_update_cursor: Option<i64>,
    pub checks: Vec<ApiCheck>,
}

pub fn build_router(state: HttpAppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/checks", get(checks_handler))
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_scrape_count();
    state.metrics.refresh_uptime();
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("ошибка кодирования метрик: {err}"),
        )
            .into_response(),
    }
}

async fn checks_handler(State(state): State<HttpAppState>) -> impl IntoResponse {
    let checks = state
        .check_store
        .iterate()
        .into_iter()
        .map(|(check_id, s)| ApiCheck {
            reported: s.status == StateStatus::Alert && s.consecutive >= state.min_consecutive,
            check_id,
            state: s,
        })
        .collect();
    Json(ApiChecks {
        host: state.host.clone(),
        last_update_cursor: state.check_store.last_update_cursor(),
        checks,
    })
}
