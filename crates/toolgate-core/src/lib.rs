//! Toolgate Core - building blocks for the streaming tool proxy
//!
//! This crate holds everything below the HTTP layer: the keyword detector
//! that watches a model's token stream, the tool registry the model can
//! invoke, heartbeat frame generation, and the queue/cancellation plumbing
//! shared between the upstream reader and the downstream writer.

pub mod config;
pub mod detector;
pub mod error;
pub mod frame;
pub mod heartbeat;
pub mod pool;
pub mod queue;
pub mod runner;
pub mod tools;

pub use config::{ProxyConfig, Verbosity};
pub use detector::{ToolCallDetector, Verdict};
pub use error::ProxyError;
pub use frame::TurnStatus;
pub use tools::{LoopDetector, ToolCommand, ToolRegistry, ToolVerdict};
