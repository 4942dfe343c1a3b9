pub mod fetch;
pub mod transport;

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub use fetch::{fetch, RetryPolicy};
pub use transport::MeterTransport;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Unable to load client credentials from {path}: {source}")]
    Credentials { path: PathBuf, source: openssl::error::ErrorStack },
    #[error("TLS setup failed: {0}")]
    Tls(openssl::error::ErrorStack),
    #[error("Invalid meter URL {0}")]
    InvalidUrl(String),
    #[error("{url} is not served by the meter at {authority}")]
    ForeignHost { url: String, authority: String },
    #[error("TLS handshake failed: {0}")]
    Handshake(String),
    #[error("Connection failed: {0}")]
    Connection(String),
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    #[error("Reading response body failed: {0}")]
    Body(String),
}

impl TransportError {
    /// Failures a flaky meter produces on its own: refused or reset
    /// connections, broken handshakes and timeouts.
    pub fn is_transient(&self) -> bool {
        matches!(self,
            TransportError::Handshake(_) |
            TransportError::Connection(_) |
            TransportError::Timeout(_) |
            TransportError::Body(_))
    }
}

/// Anything the meter's resources can be read from.
#[async_trait]
pub trait MeterSource: Send + Sync {
    /// GET `url` and return the body text whatever the status code.
    async fn get_text(&self, url: &str, timeout: Duration) -> Result<String, TransportError>;
}
