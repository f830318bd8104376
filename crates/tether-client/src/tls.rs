//! TLS configuration for mTLS connections to the broker.
//!
//! Reads the materialized PEM files back and configures rumqttc's TLS
//! transport: CA certificate, device certificate, device private key.

use rumqttc::Transport;

use crate::credentials::CredentialHandles;
use crate::error::{ClientError, ClientResult};

/// Build a TLS transport from materialized credential files.
///
/// Uses `TlsConfiguration::Simple`, which takes the PEM bytes directly;
/// certificate or key rejection surfaces during the handshake.
pub fn transport(handles: &CredentialHandles) -> ClientResult<Transport> {
    let ca = std::fs::read(handles.root_ca_path())
        .map_err(|e| ClientError::Storage(format!("failed to read root CA file: {e}")))?;

    let client_cert = std::fs::read(handles.client_cert_path())
        .map_err(|e| ClientError::Storage(format!("failed to read client cert file: {e}")))?;

    let client_key = std::fs::read(handles.private_key_path())
        .map_err(|e| ClientError::Storage(format!("failed to read private key file: {e}")))?;

    Ok(Transport::tls_with_config(
        rumqttc::TlsConfiguration::Simple {
            ca,
            alpn: None,
            client_auth: Some((client_cert, client_key)),
        },
    ))
}

/// Plaintext TCP transport (for local testing / dev mode).
pub fn plaintext_transport() -> Transport {
    Transport::Tcp
}
