use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid client request: {0}")]
    InvalidClientRequest(String),

    #[error("upstream protocol failure: {0}")]
    UpstreamProtocol(String),

    #[error("upstream transport failure: {0}")]
    UpstreamTransport(String),

    #[error("downstream sink is no longer writable")]
    DownstreamSinkLost,

    #[error("unknown tool keyword: {0}")]
    UnknownTool(String),

    #[error("tool loop guard tripped for keyword: {0}")]
    LoopGuardTripped(String),

    #[error("internal invariant violated: {0}")]
    InvariantViolation(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}
