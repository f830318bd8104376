//! Agent configuration, loadable from TOML.
//!
//! Credentials are referenced by path here and read into memory at
//! startup; the client core only ever sees opaque PEM bytes.

use serde::Deserialize;
use tether_client::{BrokerEndpoint, QoS, ReconnectConfig};

/// Top-level configuration for the agent.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Broker endpoint settings.
    pub endpoint: BrokerEndpoint,
    /// Reconnect policy. Optional — defaults to 1s base, 60s cap.
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    /// Credential PEM file paths.
    pub credentials: CredentialPaths,
    /// Topic used for the demo publish/subscribe round trip.
    #[serde(default = "default_topic")]
    pub topic: String,
    /// QoS level for publishes (0, 1, or 2).
    #[serde(default)]
    pub publish_qos: u8,
    /// QoS level for the subscription (0, 1, or 2).
    #[serde(default = "default_subscribe_qos")]
    pub subscribe_qos: u8,
}

/// Where to find the PEM files on disk.
#[derive(Debug, Clone, Deserialize)]
pub struct CredentialPaths {
    /// CA certificate (e.g., AmazonRootCA1.pem).
    pub root_ca_path: String,
    /// Device X.509 certificate.
    pub client_cert_path: String,
    /// Device private key.
    pub private_key_path: String,
}

fn default_topic() -> String {
    "topic/test".to_string()
}

fn default_subscribe_qos() -> u8 {
    1
}

impl AgentConfig {
    /// Load config from a TOML file path.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }
}

/// Map a numeric QoS level onto the MQTT enum.
pub fn qos_from_level(level: u8) -> anyhow::Result<QoS> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => anyhow::bail!("invalid QoS level {other} (expected 0, 1, or 2)"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialize_minimal_config() {
        let toml = r#"
[endpoint]
host = "a1b2c3-ats.iot.ap-southeast-1.amazonaws.com"
client_id = "dev-001"

[credentials]
root_ca_path = "/etc/tether/AmazonRootCA1.pem"
client_cert_path = "/etc/tether/cert.pem"
private_key_path = "/etc/tether/key.pem"
"#;
        let config: AgentConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.endpoint.port, 8883); // default
        assert!(config.endpoint.use_tls);
        assert_eq!(config.topic, "topic/test");
        assert_eq!(config.publish_qos, 0);
        assert_eq!(config.subscribe_qos, 1);
        assert_eq!(config.reconnect.base_delay_ms, 1_000);
    }

    #[test]
    fn deserialize_full_config() {
        let toml = r#"
topic = "devices/dev-042/telemetry"
publish_qos = 1
subscribe_qos = 2

[endpoint]
host = "broker.example.com"
port = 1883
client_id = "dev-042"
use_tls = false
connect_timeout_ms = 3000

[reconnect]
base_delay_ms = 500
max_delay_ms = 30000
max_attempts = 5

[credentials]
root_ca_path = "/certs/ca.pem"
client_cert_path = "/certs/cert.pem"
private_key_path = "/certs/key.pem"
"#;
        let config: AgentConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.endpoint.port, 1883);
        assert!(!config.endpoint.use_tls);
        assert_eq!(config.reconnect.max_attempts, 5);
        assert_eq!(config.topic, "devices/dev-042/telemetry");
    }

    #[test]
    fn qos_levels() {
        assert_eq!(qos_from_level(0).unwrap(), QoS::AtMostOnce);
        assert_eq!(qos_from_level(1).unwrap(), QoS::AtLeastOnce);
        assert_eq!(qos_from_level(2).unwrap(), QoS::ExactlyOnce);
        assert!(qos_from_level(3).is_err());
    }

    #[test]
    fn from_file_roundtrip() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[endpoint]
host = "broker.example.com"
client_id = "dev-001"

[credentials]
root_ca_path = "/certs/ca.pem"
client_cert_path = "/certs/cert.pem"
private_key_path = "/certs/key.pem"
"#
        )
        .unwrap();

        let config = AgentConfig::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.endpoint.host, "broker.example.com");
    }
}
