//! Error types for `devtunnel` core library.

use thiserror::Error;

/// Result type alias using `devtunnel` Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `devtunnel` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// OS version string could not be parsed
    #[error("Invalid OS version: {0:?}")]
    Version(String),
}
