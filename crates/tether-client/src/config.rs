//! Broker endpoint and reconnect policy configuration.

use std::time::Duration;

use serde::Deserialize;

/// One broker endpoint. Immutable after construction.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerEndpoint {
    /// Broker hostname (e.g., AWS IoT endpoint).
    pub host: String,
    /// Broker port (default 8883 for TLS).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Client ID. Must be unique per concurrently-connected session:
    /// brokers disconnect the older session when an ID is reused.
    pub client_id: String,
    /// Keep-alive interval in seconds.
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u16,
    /// Handshake deadline in milliseconds. A connect that exceeds it
    /// leaves the session in `Failed`.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Enable TLS (mTLS). When false, connects plaintext (local dev).
    #[serde(default = "default_use_tls")]
    pub use_tls: bool,
}

impl BrokerEndpoint {
    /// TLS endpoint with default port, keep-alive, and timeout.
    pub fn new(host: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            client_id: client_id.into(),
            keepalive_secs: default_keepalive(),
            connect_timeout_ms: default_connect_timeout(),
            use_tls: true,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn default_port() -> u16 {
    8883
}

fn default_keepalive() -> u16 {
    30
}

fn default_connect_timeout() -> u64 {
    10_000
}

fn default_use_tls() -> bool {
    true
}

// ── Reconnect policy ──────────────────────────────────────────

/// Exponential backoff policy for reconnecting after a transport drop.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    /// First retry delay in milliseconds.
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    /// Delay cap in milliseconds.
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    /// Additive jitter bound in milliseconds (0 disables jitter).
    #[serde(default = "default_jitter")]
    pub jitter_ms: u64,
    /// Retry limit before the session transitions to `Failed`.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            jitter_ms: default_jitter(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl ReconnectConfig {
    /// Delay before reconnect attempt `attempt` (1-based): doubles from
    /// the base up to the cap, plus uniform jitter.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let delay = self
            .base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_delay_ms);
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::random_range(0..=self.jitter_ms)
        };
        Duration::from_millis(delay + jitter)
    }
}

fn default_base_delay() -> u64 {
    1_000
}

fn default_max_delay() -> u64 {
    60_000
}

fn default_jitter() -> u64 {
    250
}

fn default_max_attempts() -> u32 {
    10
}
