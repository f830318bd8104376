//! Tether agent — connects a device to a cloud MQTT broker over mTLS.
//!
//! Reads a TOML config, loads the PEM credentials it points at, opens
//! the device client, runs a demo publish/subscribe round trip, and
//! tears everything down on ctrl-c.

use tracing_subscriber::EnvFilter;

use tether_agent::config::{AgentConfig, qos_from_level};
use tether_client::DeviceClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "tether-agent starting");

    // ── Load config ─────────────────────────────────────────────
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/tether/agent.toml".to_string());
    let config = AgentConfig::from_file(&config_path)?;
    tracing::info!(
        host = %config.endpoint.host,
        client_id = %config.endpoint.client_id,
        "config loaded"
    );

    let publish_qos = qos_from_level(config.publish_qos)?;
    let subscribe_qos = qos_from_level(config.subscribe_qos)?;

    // ── Read credentials ────────────────────────────────────────
    let root_ca = std::fs::read(&config.credentials.root_ca_path)?;
    let client_cert = std::fs::read(&config.credentials.client_cert_path)?;
    let private_key = std::fs::read(&config.credentials.private_key_path)?;

    // ── Open the client ─────────────────────────────────────────
    let client = DeviceClient::open_with(
        &config.endpoint,
        config.reconnect.clone(),
        &root_ca,
        &client_cert,
        &private_key,
    )
    .await?;
    drop((root_ca, client_cert, private_key));

    let mut events = client.events();

    client
        .subscribe(&config.topic, subscribe_qos, |topic: &str, payload: &[u8]| {
            tracing::info!(
                topic = %topic,
                payload = %String::from_utf8_lossy(payload),
                "received message"
            );
        })
        .await?;

    client
        .publish(&config.topic, b"Hello from tether-agent", publish_qos)
        .await?;
    tracing::info!(topic = %config.topic, "demo message published");

    // ── Run until shutdown ──────────────────────────────────────
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    tracing::info!(?event, "lifecycle event");
                    if matches!(event, tether_client::ClientEvent::ConnectionLost { .. }) {
                        tracing::error!("connection lost, shutting down");
                        break;
                    }
                }
                Err(_) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
                break;
            }
        }
    }

    client.close().await?;
    tracing::info!("tether-agent stopped");
    Ok(())
}
