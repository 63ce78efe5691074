use std::fmt;

use crate::response::ParseError;
use crate::template::ResolutionError;

/// Stage of a request lifecycle, used to label timeouts and I/O failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Connect,
    Tunnel,
    Handshake,
    Send,
    Response,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Connect => "connect",
            Stage::Tunnel => "tunnel",
            Stage::Handshake => "tls handshake",
            Stage::Send => "send",
            Stage::Response => "response",
        };
        f.write_str(name)
    }
}

/// Every way a proxied request can fail.
///
/// The `Display` text is what `on_error` receives, so each variant names the
/// failing stage.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("resolution error: {0}")]
    Resolution(#[from] ResolutionError),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("{0} timeout")]
    Timeout(Stage),
    #[error("malformed response: {0}")]
    Parse(#[from] ParseError),
    #[error("{stage} failed: {source}")]
    Io {
        stage: Stage,
        #[source]
        source: std::io::Error,
    },
    #[error("proxy tunnel rejected: {0}")]
    Tunnel(String),
    #[error("tls error: {0}")]
    Tls(String),
}

impl ProxyError {
    pub fn configuration(message: impl Into<String>) -> Self {
        ProxyError::Configuration(message.into())
    }

    pub fn io(stage: Stage, source: std::io::Error) -> Self {
        ProxyError::Io { stage, source }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ProxyError::Timeout(_))
    }
}
