//! Proxy configuration: upstream endpoint and log verbosity.

use tracing::level_filters::LevelFilter;

use crate::error::ProxyError;

/// How chatty the proxy is. Levels are strictly ordered; each level includes
/// everything below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    Silent,
    Error,
    Warning,
    Debug,
}

impl Verbosity {
    /// Maps onto the tracing filter installed by the daemon at startup.
    pub fn level_filter(self) -> LevelFilter {
        match self {
            Verbosity::Silent => LevelFilter::OFF,
            Verbosity::Error => LevelFilter::ERROR,
            Verbosity::Warning => LevelFilter::WARN,
            Verbosity::Debug => LevelFilter::DEBUG,
        }
    }

    /// Parses an environment-variable spelling. Unknown values yield `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "silent" => Some(Verbosity::Silent),
            "error" => Some(Verbosity::Error),
            "warning" | "warn" => Some(Verbosity::Warning),
            "debug" => Some(Verbosity::Debug),
            _ => None,
        }
    }
}

/// Settings for one proxy instance. Read-only after startup.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub verbosity: Verbosity,
    pub upstream_host: String,
    pub upstream_port: u16,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            verbosity: Verbosity::Silent,
            upstream_host: "localhost".to_string(),
            upstream_port: 11434,
        }
    }
}

impl ProxyConfig {
    /// Host must be non-empty ASCII alphanumerics plus `.` and `-`, port
    /// must be non-zero.
    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.upstream_host.is_empty() {
            return Err(ProxyError::Config("upstream host is empty".to_string()));
        }
        if self.upstream_port == 0 {
            return Err(ProxyError::Config("upstream port is zero".to_string()));
        }
        for ch in self.upstream_host.chars() {
            if ch.is_ascii_alphanumeric() || ch == '.' || ch == '-' {
                continue;
            }
            return Err(ProxyError::Config(format!(
                "upstream host contains disallowed character {:?}",
                ch
            )));
        }
        Ok(())
    }

    pub fn upstream_url(&self) -> String {
        format!("http://{}:{}", self.upstream_host, self.upstream_port)
    }
}
