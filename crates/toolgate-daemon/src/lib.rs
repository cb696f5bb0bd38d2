//! Toolgate Daemon library
//!
//! HTTP proxy that sits between a chat client and a local Ollama-style LLM
//! server. Features:
//! - Streaming `/api/chat` mediation: the model can invoke backend tools by
//!   opening its turn with a registered keyword
//! - Tool results are fed back to the model as synthetic user turns while
//!   the client's chunked response stays open
//! - Heartbeat frames keep the client progressing during tool execution
//! - Every other route is transparently reverse-proxied to the upstream

pub mod proxy;
pub mod session;
pub mod upstream;
