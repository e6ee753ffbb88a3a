//! HTTP routes: the `/ws` upgrade, read-only JSON API and health check.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Request, State, WebSocketUpgrade};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{Method, StatusCode, Uri};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use super::Dispatcher;
use crate::models::{NodeData, ServerDiagnostics, ServerInfo};
use crate::websocket::session::MAX_MESSAGE_SIZE;
use crate::websocket::Handler;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub ws: Handler,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    code: u16,
    timestamp: DateTime<Utc>,
}

/// JSON error response with the matching status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        log::warn!("http error {}: {}", self.status.as_u16(), self.message);
        let body = ErrorBody {
            error: self.message,
            code: self.status.as_u16(),
            timestamp: Utc::now(),
        };
        (self.status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    timestamp: DateTime<Utc>,
    connections: usize,
    nodes: usize,
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let handler = state.ws.clone();
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| async move { handler.accept(socket).await })
}

async fn info(State(state): State<AppState>) -> Json<ServerInfo> {
    Json(state.dispatcher.server_info())
}

async fn nodes(State(state): State<AppState>) -> Json<Vec<NodeData>> {
    Json(state.dispatcher.nodes())
}

async fn diagnostics(State(state): State<AppState>) -> Json<ServerDiagnostics> {
    Json(state.dispatcher.diagnostics())
}

async fn health(State(state): State<AppState>) -> Json<Health> {
    Json(Health {
        status: "ok",
        timestamp: Utc::now(),
        connections: state.ws.connection_count(),
        nodes: state.dispatcher.node_count(),
    })
}

async fn not_found(uri: Uri) -> ApiError {
    ApiError::new(StatusCode::NOT_FOUND, format!("no route for {}", uri.path()))
}

/// Allow any origin; preflight requests are answered by the layer.
fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([CONTENT_TYPE, AUTHORIZATION])
}

async fn log_requests(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let start = Instant::now();
    let resp = next.run(req).await;
    log::info!(
        "{} {} {} {:?}",
        method,
        path,
        resp.status().as_u16(),
        start.elapsed()
    );
    resp
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/api/info", get(info))
        .route("/api/nodes", get(nodes))
        .route("/api/diagnostics", get(diagnostics))
        .route("/health", get(health))
        .fallback(not_found)
        .layer(cors())
        .layer(middleware::from_fn(log_requests))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::storage::{JsonStorage, Storage};

    #[tokio::test]
    async fn api_error_body() {
        let resp = ApiError::new(StatusCode::NOT_FOUND, "gone").into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v["error"], "gone");
        assert_eq!(v["code"], 404);
        assert!(v["timestamp"].is_string());
    }

    #[tokio::test]
    async fn router_builds_with_state() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonStorage::new(dir.path());
        storage.start().unwrap();
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(storage),
            EventBus::new(),
            ServerInfo::new(3),
        ));
        let state = AppState {
            ws: Handler::new(dispatcher.clone()),
            dispatcher,
        };
        let Json(h) = health(State(state.clone())).await;
        assert_eq!(h.status, "ok");
        assert_eq!(h.connections, 0);
        let Json(i) = info(State(state.clone())).await;
        assert_eq!(i.fabric_id, 3);
        let _ = router(state);
    }
}
