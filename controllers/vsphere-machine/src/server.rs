//! Health and metrics endpoints
//!
//! - `GET /healthz`: process liveness
//! - `GET /readyz`: 200 once the controller is watching, 503 before
//! - `GET /metrics`: Prometheus text exposition

use crate::error::ControllerError;
use crate::metrics;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Readiness flag shared between the controller and the readiness handler
#[derive(Clone, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    pub fn set_ready(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub fn router(readiness: Readiness) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_text))
        .layer(TraceLayer::new_for_http())
        .with_state(readiness)
}

async fn readyz(State(readiness): State<Readiness>) -> impl IntoResponse {
    if readiness.is_ready() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

async fn metrics_text() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather(),
    )
}

/// Serve the health endpoints until the listener fails
pub async fn serve(addr: SocketAddr, readiness: Readiness) -> Result<(), ControllerError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ControllerError::InvalidConfig(format!("cannot bind {}: {}", addr, e)))?;
    info!("Serving health checks and metrics on {}", addr);
    axum::serve(listener, router(readiness))
        .await
        .map_err(|e| ControllerError::Watch(format!("metrics server failed: {}", e)))
}
