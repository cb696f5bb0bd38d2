//! HTTP surface: the mediated chat endpoint and the transparent
//! reverse-proxy fallback for every other route.

use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::warn;

use toolgate_core::{ProxyConfig, ProxyError, ToolRegistry};

use crate::session::ChatSession;
use crate::upstream::{HttpUpstream, Upstream};

#[derive(Clone)]
pub struct AppState {
    config: Arc<ProxyConfig>,
    registry: Arc<ToolRegistry>,
    upstream: Arc<dyn Upstream>,
    http_client: reqwest::Client,
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: ProxyConfig, registry: Arc<ToolRegistry>, shutdown: CancellationToken) -> Self {
        Self {
            upstream: Arc::new(HttpUpstream::new(&config.upstream_url())),
            config: Arc::new(config),
            registry,
            http_client: reqwest::Client::new(),
            shutdown,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/chat", post(handle_chat))
        .fallback(proxy_passthrough)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// The status the proxy answers bad chat requests with. 504 is what clients
/// of the original service already expect, so it stays.
fn reject_chat(message: String) -> Response {
    (StatusCode::GATEWAY_TIMEOUT, message).into_response()
}

/// `POST /api/chat`: validates the request and hands the connection over to
/// a [`ChatSession`] whose frame stream becomes the chunked response body.
async fn handle_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if content_type != "application/json" {
        return reject_chat(
            "Invalid content type. Expected application/json from user.".to_string(),
        );
    }

    let client_json: Value = match serde_json::from_slice(&body) {
        Ok(json) => json,
        Err(err) => return reject_chat(format!("Invalid JSON. Error: {err}")),
    };

    match ChatSession::start(
        client_json,
        state.registry.clone(),
        state.upstream.clone(),
        &state.shutdown,
    ) {
        Ok(session) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from_stream(session.into_response_stream()))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
        Err(ProxyError::InvalidClientRequest(message)) => {
            reject_chat(format!("Invalid JSON. Error: {message}"))
        }
        Err(err) => reject_chat(format!("Invalid JSON. Error: {err}")),
    }
}

/// Everything that is not `/api/chat` goes to the upstream untouched.
async fn proxy_passthrough(State(state): State<AppState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(err) => {
            return (StatusCode::BAD_REQUEST, format!("Unreadable body: {err}")).into_response()
        }
    };

    let mut url = format!("{}{}", state.config.upstream_url(), parts.uri.path());
    if let Some(query) = parts.uri.query() {
        url.push('?');
        url.push_str(query);
    }

    let mut upstream_request = state
        .http_client
        .request(parts.method.clone(), &url)
        .body(bytes.to_vec());
    for (name, value) in parts.headers.iter() {
        // reqwest computes these itself for the rebuilt request.
        if name == header::HOST || name == header::CONTENT_LENGTH {
            continue;
        }
        upstream_request = upstream_request.header(name, value);
    }

    match upstream_request.send().await {
        Ok(upstream_response) => {
            let mut builder = Response::builder().status(upstream_response.status());
            for (name, value) in upstream_response.headers() {
                if name == header::TRANSFER_ENCODING {
                    continue;
                }
                builder = builder.header(name, value);
            }
            builder
                .body(Body::from_stream(upstream_response.bytes_stream()))
                .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
        }
        Err(err) => {
            warn!("passthrough {} {} failed: {err}", parts.method, parts.uri);
            (StatusCode::BAD_GATEWAY, format!("Upstream unreachable: {err}")).into_response()
        }
    }
}
