use crate::core::{ProxyError, Result};
use crate::dispatcher::Dispatcher;
use crate::server::http::MSGPACK;
use crate::wire::{self, ConnectReply, ConnectRequest, ConnectResponse, Reply, Request, Response};
use async_trait::async_trait;
use log::trace;
use reqwest::header::CONTENT_TYPE;
use std::sync::Arc;
use std::time::Duration;

/// Point-to-point channel to a dispatcher.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, request: ConnectRequest) -> Result<ConnectResponse>;

    /// Remote failures come back as [`ProxyError::Remote`].
    async fn send(&self, request: Request) -> Result<Response>;
}

/// In-process transport.
///
/// Every message still goes through the wire codec in both directions, so
/// it behaves like a remote channel minus the network.
#[derive(Clone)]
pub struct LocalTransport {
    dispatcher: Arc<Dispatcher>,
}

impl LocalTransport {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn connect(&self, request: ConnectRequest) -> Result<ConnectResponse> {
        let request: ConnectRequest = wire::decode(&wire::encode(&request)?)?;
        let reply = self.dispatcher.handle_connect(request).await;
        let reply: ConnectReply = wire::decode(&wire::encode(&reply)?)?;
        reply.map_err(ProxyError::from)
    }

    async fn send(&self, request: Request) -> Result<Response> {
        let bytes = wire::encode(&request)?;
        trace!("local request: {} bytes", bytes.len());
        let request: Request = wire::decode(&bytes)?;
        let reply = self.dispatcher.handle(request).await;
        let reply: Reply = wire::decode(&wire::encode(&reply)?)?;
        reply.map_err(ProxyError::from)
    }
}

/// Transport over the HTTP tunnel served by [`crate::server::http`].
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    /// `base_url` like `http://127.0.0.1:7878`.
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_timeout(base_url, Duration::from_secs(300))
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProxyError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post(&self, path: &str, body: Vec<u8>) -> Result<Vec<u8>> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, MSGPACK)
            .body(body)
            .send()
            .await
            .map_err(|e| ProxyError::Transport(format!("POST {}: {}", url, e)))?;

        let status = response.status();
        let is_msgpack = response
            .headers()
            .get(CONTENT_TYPE)
            .map(|v| v.as_bytes() == MSGPACK.as_bytes())
            .unwrap_or(false);
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ProxyError::Transport(format!("POST {}: {}", url, e)))?;

        if !is_msgpack {
            return Err(ProxyError::Transport(format!(
                "POST {}: HTTP {}: {}",
                url,
                status,
                String::from_utf8_lossy(&bytes)
            )));
        }
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn connect(&self, request: ConnectRequest) -> Result<ConnectResponse> {
        let bytes = self.post("/connect", wire::encode(&request)?).await?;
        let reply: ConnectReply = wire::decode(&bytes)?;
        reply.map_err(ProxyError::from)
    }

    async fn send(&self, request: Request) -> Result<Response> {
        let bytes = self.post("/execute", wire::encode(&request)?).await?;
        let reply: Reply = wire::decode(&bytes)?;
        reply.map_err(ProxyError::from)
    }
}
