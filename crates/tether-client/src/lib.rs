//! Tether device client — MQTT over mTLS for cloud IoT brokers.
//!
//! Provides the pieces a device needs to talk to a broker securely:
//! - `CredentialStore` for ephemeral, permission-restricted PEM storage
//! - `ConnectionManager` owning the session lifecycle and reconnects
//! - `TopicRouter` for subscription-to-handler dispatch
//! - `DeviceClient` facade composing the above behind `open`/`close`
//! - `Channel` trait + `MockChannel` for broker-free tests

pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod credentials;
pub mod error;
pub mod mock;
pub mod router;
pub mod tls;

// Re-exports for convenience.
pub use channel::{Channel, MqttChannel};
pub use client::DeviceClient;
pub use config::{BrokerEndpoint, ReconnectConfig};
pub use connection::{ClientEvent, ConnectionManager, SessionState};
pub use credentials::{CredentialHandles, CredentialStore};
pub use error::{ClientError, ClientResult};
pub use mock::MockChannel;
pub use router::{MessageHandler, SubscriptionHandle, TopicRouter};

// Re-export the QoS enum so embedders don't need a direct rumqttc dep.
pub use rumqttc::QoS;
