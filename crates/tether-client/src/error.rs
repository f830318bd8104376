//! Device client error types.

use thiserror::Error;

use crate::connection::SessionState;

/// Errors that can occur during device client operations.
///
/// Transient network failures (`Network`, `Timeout` while connected) are
/// retried internally by the reconnect policy; everything else surfaces
/// synchronously to the caller.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Credential materialization or release failed.
    #[error("credential storage error: {0}")]
    Storage(String),

    /// The broker rejected the certificate or key. Fatal — not retried.
    #[error("authentication error: {0}")]
    Authentication(String),

    /// Endpoint unreachable or transport-level I/O failure.
    #[error("network error: {0}")]
    Network(String),

    /// Handshake exceeded the configured deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Publish/subscribe attempted while the session is not connected.
    #[error("not connected (session state: {state:?})")]
    NotConnected { state: SessionState },

    /// The transport rejected a publish (payload too large, QoS unsupported).
    #[error("publish error: {0}")]
    Publish(String),

    /// The transport rejected a subscribe.
    #[error("subscribe error: {0}")]
    Subscribe(String),
}

/// Convenience alias for device client results.
pub type ClientResult<T> = Result<T, ClientError>;
