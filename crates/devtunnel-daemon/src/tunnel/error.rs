//! Tunnel helper error types.

use std::time::Duration;

/// Errors that can occur while starting a tunnel helper.
///
/// All of them are recoverable: the device supervisor logs the error and
/// retries after its back-off.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("Failed to spawn tunnel helper: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Tunnel helper stdout was not captured")]
    NoStdout,

    #[error("Device reports unparseable OS version {0:?}")]
    InvalidVersion(String),

    #[error("Tunnel helper start-tunnel empty response")]
    EmptyResponse,

    #[error("Malformed tunnel handshake: {0:?}")]
    MalformedHandshake(String),

    #[error("Invalid tunnel port in handshake: {0:?}")]
    InvalidPort(String),

    #[error("Failed to read tunnel handshake: {0}")]
    Read(#[source] std::io::Error),

    #[error("No tunnel handshake within {0:?}")]
    HandshakeTimeout(Duration),
}
