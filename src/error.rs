//! Error types for the render pipeline and proxy

use thiserror::Error;

/// Result type alias for proxy and render operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while rendering or proxying a page
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to initialize the browser session or the worker thread
    #[error("Engine initialization failed: {0}")]
    InitializationError(String),

    /// Failed to navigate to a URL
    #[error("Failed to load URL: {0}")]
    LoadError(String),

    /// Failed to extract or rewrite content
    #[error("Rendering failed: {0}")]
    RenderError(String),

    /// Operation timed out
    #[error("Operation timed out after {0}ms")]
    Timeout(u64),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    /// Network error while talking to the backend
    #[error("Network error: {0}")]
    NetworkError(String),

    /// CDP-specific error
    #[cfg(feature = "cdp")]
    #[error("CDP error: {0}")]
    CdpError(String),

    /// The render worker has stopped accepting or resolving tasks
    #[error("Render worker is closed")]
    WorkerClosed,

    /// I/O error (listener, config file)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Builds a timeout error from a duration.
    pub fn timeout(after: std::time::Duration) -> Self {
        Error::Timeout(after.as_millis().min(u64::MAX as u128) as u64)
    }
}

#[cfg(feature = "cdp")]
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::CdpError(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::NetworkError(format!("backend request timed out: {}", err))
        } else {
            Error::NetworkError(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn timeout_reports_milliseconds() {
        let err = Error::timeout(Duration::from_secs(5));
        assert_eq!(err.to_string(), "Operation timed out after 5000ms");
    }

    #[test]
    fn worker_closed_display() {
        assert_eq!(Error::WorkerClosed.to_string(), "Render worker is closed");
    }
}
