//! HTTP server for signaling, health checks and metrics

use crate::web::shared::SharedState;
use axum::{
    body::Body,
    extract::{State, WebSocketUpgrade},
    http::{header, StatusCode},
    response::Response,
    routing::get,
    Router,
};
use log::{error, info};
use std::sync::Arc;
use tokio::net::TcpListener;

/// Routes: signaling WebSocket at the configured path, `/health`, `/metrics`
pub fn build_router(state: Arc<SharedState>) -> Router {
    let path = state.config.server.signaling_path.trim_end_matches('/').to_string();
    let path = if path.is_empty() { "/".to_string() } else { path };

    let mut app = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route(&path, get(signaling_handler));
    if path != "/" {
        app = app.route(&format!("{}/", path), get(signaling_handler));
    }
    info!("Signaling endpoint at {}", path);
    app.with_state(state)
}

/// Bind and serve until the listener fails
pub async fn run_http_server(state: Arc<SharedState>) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", state.config.server.host, state.config.server.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("HTTP server listening on http://{}", addr);
    serve(listener, state).await
}

pub async fn serve(
    listener: TcpListener,
    state: Arc<SharedState>,
) -> Result<(), Box<dyn std::error::Error>> {
    axum::serve(listener, build_router(state))
        .await
        .map_err(|e| Box::new(e) as Box<dyn std::error::Error>)?;
    Ok(())
}

async fn signaling_handler(ws: WebSocketUpgrade, State(state): State<Arc<SharedState>>) -> Response {
    ws.on_upgrade(move |socket| async move {
        crate::transport::handle_signaling_connection(socket, state).await;
    })
}

/// Health check handler
async fn health_handler(State(state): State<Arc<SharedState>>) -> Response {
    let body = state.health_json().to_string();
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap_or_default()
}

/// Metrics handler (Prometheus format)
async fn metrics_handler(State(state): State<Arc<SharedState>>) -> Response {
    state.refresh_gauges();
    match state.metrics.render() {
        Ok(text) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
            .body(Body::from(text))
            .unwrap_or_default(),
        Err(e) => {
            error!("Failed to render metrics: {}", e);
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::empty())
                .unwrap_or_default()
        }
    }
}
