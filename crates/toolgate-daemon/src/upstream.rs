//! Upstream chat client.
//!
//! The upstream speaks newline-delimited JSON over a streaming POST: one
//! frame per line, frames may arrive split across body chunks. The trait
//! seam exists so the chat session can be driven by a scripted upstream in
//! tests.

use std::pin::Pin;

use bytes::BytesMut;
use futures::{Stream, StreamExt};
use serde_json::Value;
use toolgate_core::ProxyError;

/// One upstream turn: a stream of parsed frames, first chunk to `done:true`.
pub type TurnStream = Pin<Box<dyn Stream<Item = Result<Value, ProxyError>> + Send>>;

pub trait Upstream: Send + Sync {
    fn chat(&self, request: Value) -> TurnStream;
}

/// Reassembles NDJSON lines from arbitrarily sliced body chunks. Bytes are
/// buffered raw and decoded only once a full line is present, so a
/// multi-byte character split across a chunk boundary survives intact.
#[derive(Default)]
struct NdjsonBuffer {
    pending: BytesMut,
}

impl NdjsonBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(newline) = self.pending.iter().position(|&byte| byte == b'\n') {
            let line = self.pending.split_to(newline + 1);
            let line = String::from_utf8_lossy(&line[..newline]).trim().to_string();
            if !line.is_empty() {
                lines.push(line);
            }
        }
        lines
    }

    /// Trailing data after the last newline still counts as one frame.
    fn finish(self) -> Option<String> {
        let rest = String::from_utf8_lossy(&self.pending).trim().to_string();
        if rest.is_empty() {
            None
        } else {
            Some(rest)
        }
    }
}

pub struct HttpUpstream {
    client: reqwest::Client,
    chat_url: String,
}

impl HttpUpstream {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            chat_url: format!("{base_url}/api/chat"),
        }
    }
}

impl Upstream for HttpUpstream {
    fn chat(&self, request: Value) -> TurnStream {
        let client = self.client.clone();
        let url = self.chat_url.clone();
        Box::pin(async_stream::stream! {
            let response = match client.post(&url).json(&request).send().await {
                Ok(response) => response,
                Err(err) => {
                    yield Err(ProxyError::UpstreamTransport(err.to_string()));
                    return;
                }
            };
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                yield Err(ProxyError::UpstreamTransport(format!("{status}: {body}")));
                return;
            }

            let mut body = response.bytes_stream();
            let mut buffer = NdjsonBuffer::default();
            while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        yield Err(ProxyError::UpstreamTransport(err.to_string()));
                        return;
                    }
                };
                for line in buffer.push(&chunk) {
                    match serde_json::from_str::<Value>(&line) {
                        Ok(frame) => yield Ok(frame),
                        Err(err) => {
                            yield Err(ProxyError::UpstreamProtocol(format!(
                                "unparseable frame: {err}"
                            )));
                            return;
                        }
                    }
                }
            }
            if let Some(line) = buffer.finish() {
                match serde_json::from_str::<Value>(&line) {
                    Ok(frame) => yield Ok(frame),
                    Err(err) => yield Err(ProxyError::UpstreamProtocol(format!(
                        "unparseable frame: {err}"
                    ))),
                }
            }
        })
    }
}
