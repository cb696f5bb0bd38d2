//! End-to-end tests over real sockets: a mock NDJSON upstream behind the
//! proxy, driven by a plain reqwest client.

use std::future::IntoFuture;
use std::sync::Arc;

use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use toolgate_core::tools::{keyword_only, ToolCommand, ToolRegistry};
use toolgate_core::{ProxyConfig, Verbosity};
use toolgate_daemon::proxy::{router, AppState};

fn frame_line(content: &str, done: bool) -> String {
    let frame = json!({
        "created_at": "2025-04-26T12:13:59.246926Z",
        "done": done,
        "model": "mock",
        "message": { "role": "assistant", "content": content },
    });
    format!("{frame}\n")
}

/// Mock upstream: first turn answers with a keyword split across two
/// frames; once the tool result ("pong") comes back as a user message it
/// produces the final prose turn.
async fn mock_chat(Json(request): Json<Value>) -> impl IntoResponse {
    let last_content = request["messages"]
        .as_array()
        .and_then(|messages| messages.last())
        .and_then(|message| message["content"].as_str())
        .unwrap_or_default()
        .to_string();

    let body = if last_content == "pong\n" {
        frame_line("The pong arrived.", true)
    } else {
        format!("{}{}", frame_line("AI_P", false), frame_line("ING", true))
    };
    ([(header::CONTENT_TYPE, "application/json")], body)
}

async fn spawn_mock_upstream() -> u16 {
    let app = Router::new()
        .route("/api/chat", post(mock_chat))
        .route(
            "/api/tags",
            get(|| async { Json(json!({"models": [{"name": "mock"}]})) }),
        );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(axum::serve(listener, app).into_future());
    port
}

async fn spawn_proxy(upstream_port: u16, registry: ToolRegistry) -> String {
    let config = ProxyConfig {
        verbosity: Verbosity::Silent,
        upstream_host: "127.0.0.1".to_string(),
        upstream_port,
    };
    config.validate().unwrap();
    let state = AppState::new(config, Arc::new(registry), CancellationToken::new());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(axum::serve(listener, router(state)).into_future());
    format!("http://127.0.0.1:{port}")
}

fn ping_registry() -> ToolRegistry {
    ToolRegistry::new([ToolCommand::new(
        "AI_PING",
        "Respond with single word ${KEYWORD} to ping the backend.",
        keyword_only(|_| "pong".to_string()),
    )
    .unwrap()])
    .unwrap()
}

/// The proxy forwards frames without separators; split the concatenated
/// response body back into JSON values.
fn parse_frames(body: &str) -> Vec<Value> {
    serde_json::Deserializer::from_str(body)
        .into_iter::<Value>()
        .collect::<Result<_, _>>()
        .expect("body should be a sequence of JSON frames")
}

fn contents(frames: &[Value]) -> Vec<String> {
    frames
        .iter()
        .map(|frame| {
            frame["message"]["content"]
                .as_str()
                .unwrap_or_default()
                .to_string()
        })
        .collect()
}

#[tokio::test]
async fn chat_without_tools_streams_every_frame() {
    let upstream_port = spawn_mock_upstream().await;
    let proxy = spawn_proxy(upstream_port, ToolRegistry::empty()).await;

    let response = reqwest::Client::new()
        .post(format!("{proxy}/api/chat"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(json!({"model": "mock", "stream": true, "messages": [{"role": "user", "content": "hi"}]}).to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let body = response.text().await.unwrap();
    let frames = parse_frames(&body);
    assert_eq!(contents(&frames), vec!["AI_P", "ING"]);
    assert_eq!(frames[1]["done"], json!(true));
}

#[tokio::test]
async fn tool_round_trip_over_http() {
    let upstream_port = spawn_mock_upstream().await;
    let proxy = spawn_proxy(upstream_port, ping_registry()).await;

    let response = reqwest::Client::new()
        .post(format!("{proxy}/api/chat"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(json!({"model": "mock", "stream": true, "messages": [{"role": "user", "content": "ping please"}]}).to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let body = response.text().await.unwrap();
    // The keyword turn was intercepted, never forwarded.
    assert!(!body.contains("AI_PING"));
    assert!(!body.contains("AI_P\""));

    let frames = parse_frames(&body);
    assert_eq!(
        contents(&frames),
        vec!["Working.", ".\n\n", "The pong arrived."]
    );
}

#[tokio::test]
async fn other_routes_are_proxied_transparently() {
    let upstream_port = spawn_mock_upstream().await;
    let proxy = spawn_proxy(upstream_port, ToolRegistry::empty()).await;

    let response = reqwest::get(format!("{proxy}/api/tags")).await.unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["models"][0]["name"], json!("mock"));
}

#[tokio::test]
async fn wrong_content_type_yields_504() {
    let upstream_port = spawn_mock_upstream().await;
    let proxy = spawn_proxy(upstream_port, ToolRegistry::empty()).await;

    let response = reqwest::Client::new()
        .post(format!("{proxy}/api/chat"))
        .header(header::CONTENT_TYPE, "text/plain")
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 504);
}

#[tokio::test]
async fn non_streaming_chat_yields_504() {
    let upstream_port = spawn_mock_upstream().await;
    let proxy = spawn_proxy(upstream_port, ToolRegistry::empty()).await;

    let response = reqwest::Client::new()
        .post(format!("{proxy}/api/chat"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(json!({"model": "mock", "stream": false, "messages": []}).to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 504);
}

#[tokio::test]
async fn unreachable_upstream_passthrough_yields_502() {
    // Port from the ephemeral range with nothing listening.
    let proxy = spawn_proxy(1, ToolRegistry::empty()).await;
    let response = reqwest::get(format!("{proxy}/api/tags")).await.unwrap();
    assert_eq!(response.status(), 502);
}
