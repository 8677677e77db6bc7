use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Failed to connect to {host}:{port}: {source}")]
    Dial {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out connecting to {host}:{port}")]
    DialTimeout { host: String, port: u16 },

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Upstream response error: {0}")]
    UpstreamResponse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProxyError {
    /// DNS failures, refusals and dial timeouts all count as one failure kind.
    pub fn is_dial_failure(&self) -> bool {
        matches!(self, ProxyError::Dial { .. } | ProxyError::DialTimeout { .. })
    }

    pub fn is_invalid_request(&self) -> bool {
        matches!(self, ProxyError::InvalidRequest(_))
    }
}
