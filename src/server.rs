//! HTTP surface.
//!
//! A thin axum adapter over [`LibrarianService`]; every decision lives in
//! the service, the handlers only translate.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/api/v1/context` | Answer a context query |
//! | `GET`  | `/api/v1/health` | Health report (503 when degraded) |
//! | `POST` | `/api/v1/index/refresh` | Start an index refresh (202) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_ready", "message": "index is not loaded yet; retry later" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_ready` (503, with `Retry-After`),
//! `internal` (500).

use anyhow::Result;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::error::QueryError;
use crate::pipeline::{ContextAnswer, ContextQuery};
use crate::service::{HealthReport, HealthStatus, LibrarianService};

/// Seconds clients are asked to wait before retrying a not-ready query.
const RETRY_AFTER_SECS: u64 = 5;

#[derive(Clone)]
struct AppState {
    service: Arc<LibrarianService>,
}

/// Build the router. Exposed so tests can serve it on an ephemeral port.
pub fn router(service: Arc<LibrarianService>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/context", post(handle_context))
        .route("/api/v1/health", get(handle_health))
        .route("/api/v1/index/refresh", post(handle_refresh))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(AppState { service })
}

/// Bind `bind_addr` and serve until Ctrl-C.
pub async fn run_server(service: Arc<LibrarianService>, bind_addr: &str) -> Result<()> {
    let app = router(service);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(addr = %bind_addr, "Librarian listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await?;

    Ok(())
}

// ============ Handlers ============

async fn handle_context(
    State(state): State<AppState>,
    Json(query): Json<ContextQuery>,
) -> Result<Json<ContextAnswer>, AppError> {
    let answer = state.service.answer(&query).await?;
    Ok(Json(answer))
}

async fn handle_health(State(state): State<AppState>) -> (StatusCode, Json<HealthReport>) {
    let report = state.service.health();
    let status = match report.status {
        HealthStatus::Ok => StatusCode::OK,
        HealthStatus::Degraded => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(report))
}

#[derive(Serialize)]
struct RefreshAccepted {
    status: &'static str,
}

async fn handle_refresh(State(state): State<AppState>) -> (StatusCode, Json<RefreshAccepted>) {
    if state.service.controller().is_refreshing() {
        return (
            StatusCode::ACCEPTED,
            Json(RefreshAccepted {
                status: "already_running",
            }),
        );
    }

    let service = state.service.clone();
    tokio::spawn(async move {
        service.refresh().await;
    });
    (StatusCode::ACCEPTED, Json(RefreshAccepted { status: "started" }))
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl From<QueryError> for AppError {
    fn from(err: QueryError) -> Self {
        let (status, code) = match err {
            QueryError::NotReady => (StatusCode::SERVICE_UNAVAILABLE, "not_ready"),
            QueryError::InvalidQuery(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            QueryError::Internal(_) => {
                error!(error = %err, "Query failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        };
        Self {
            status,
            code,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        let mut response = (self.status, Json(body)).into_response();
        if self.status == StatusCode::SERVICE_UNAVAILABLE {
            response.headers_mut().insert(
                header::RETRY_AFTER,
                header::HeaderValue::from(RETRY_AFTER_SECS),
            );
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_ready_maps_to_503_with_retry_after() {
        let response = AppError::from(QueryError::NotReady).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[header::RETRY_AFTER], "5");
    }

    #[test]
    fn invalid_query_maps_to_400() {
        let response = AppError::from(QueryError::InvalidQuery("empty".into())).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(response.headers().get(header::RETRY_AFTER).is_none());
    }
}
