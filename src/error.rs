use std::time::Duration;

/// Errors raised inside the scan engine.
///
/// Only target parsing surfaces these to callers. Everything that happens
/// after a scan starts is folded into classified result records instead.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("unsupported prefix /{0}: only /24 or narrower networks can be scanned")]
    UnsupportedPrefix(u8),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS setup error: {0}")]
    TlsSetup(#[from] openssl::error::ErrorStack),

    #[error("TLS handshake error: {0}")]
    TlsHandshake(#[from] openssl::ssl::Error),

    #[error("certificate error: {0}")]
    Certificate(String),
}

pub type EngineResult<T> = Result<T, ScanError>;
