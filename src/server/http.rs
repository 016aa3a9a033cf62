//! HTTP tunnel binding.
//!
//! `POST /connect` and `POST /execute` carry MessagePack bodies in both
//! directions. Failures travel inside the reply body as a normalized
//! [`RemoteError`], so the status code only separates readable requests
//! from unreadable ones.

use crate::core::{ProxyError, RemoteError, Result};
use crate::dispatcher::Dispatcher;
use crate::wire::{self, ConnectReply, ConnectRequest, Reply, Request};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{error, info};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

pub const MSGPACK: &str = "application/msgpack";

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub sessions: usize,
    pub busy_workers: usize,
}

pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route("/connect", post(connect))
        .route("/execute", post(execute))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(dispatcher)
}

/// Binds `addr` and serves until `shutdown` completes.
pub async fn serve<F>(dispatcher: Arc<Dispatcher>, addr: &str, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| ProxyError::Transport(format!("cannot bind {}: {}", addr, e)))?;
    serve_listener(dispatcher, listener, shutdown).await
}

pub async fn serve_listener<F>(
    dispatcher: Arc<Dispatcher>,
    listener: TcpListener,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!("Proxy listening on http://{}", addr);
    }
    axum::serve(listener, router(dispatcher))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| ProxyError::Transport(format!("server error: {}", e)))
}

async fn connect(State(dispatcher): State<Arc<Dispatcher>>, body: Bytes) -> Response {
    let request: ConnectRequest = match wire::decode(&body) {
        Ok(request) => request,
        Err(e) => return unreadable::<ConnectReply>(e),
    };
    let reply: ConnectReply = dispatcher.handle_connect(request).await;
    msgpack(StatusCode::OK, &reply)
}

async fn execute(State(dispatcher): State<Arc<Dispatcher>>, body: Bytes) -> Response {
    let request: Request = match wire::decode(&body) {
        Ok(request) => request,
        Err(e) => return unreadable::<Reply>(e),
    };
    let reply: Reply = dispatcher.handle(request).await;
    msgpack(StatusCode::OK, &reply)
}

async fn health(State(dispatcher): State<Arc<Dispatcher>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: if dispatcher.is_shut_down() { "stopping" } else { "ok" },
        sessions: dispatcher.session_count(),
        busy_workers: dispatcher.workers().stats().busy,
    })
}

fn unreadable<T>(err: ProxyError) -> Response
where
    std::result::Result<T, RemoteError>: Serialize,
{
    let reply: std::result::Result<T, RemoteError> = Err(err.into());
    msgpack(StatusCode::BAD_REQUEST, &reply)
}

fn msgpack<T: Serialize>(status: StatusCode, value: &T) -> Response {
    match wire::encode(value) {
        Ok(bytes) => (status, [(header::CONTENT_TYPE, MSGPACK)], bytes).into_response(),
        Err(e) => {
            error!("Failed to encode reply: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}
