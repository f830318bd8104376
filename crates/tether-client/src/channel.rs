//! Transport channel abstraction.
//!
//! `Channel` is the seam between the device client and the MQTT engine.
//! Production uses `MqttChannel` over `rumqttc::AsyncClient`; tests use
//! `MockChannel` without a broker.

use async_trait::async_trait;
use rumqttc::{AsyncClient, QoS};

use crate::error::{ClientError, ClientResult};

/// Abstraction for MQTT message publishing and subscribing.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Publish a raw payload to a topic.
    async fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> ClientResult<()>;

    /// Subscribe to a topic filter.
    async fn subscribe(&self, filter: &str, qos: QoS) -> ClientResult<()>;

    /// Remove a broker-side subscription.
    async fn unsubscribe(&self, filter: &str) -> ClientResult<()>;
}

/// Channel over a live rumqttc client.
///
/// `AsyncClient` is clonable and internally synchronized, so concurrent
/// publish/subscribe calls from multiple tasks are safe.
#[derive(Clone, Debug)]
pub struct MqttChannel {
    client: AsyncClient,
}

impl MqttChannel {
    pub(crate) fn new(client: AsyncClient) -> Self {
        Self { client }
    }

    pub(crate) async fn disconnect(&self) -> ClientResult<()> {
        self.client
            .disconnect()
            .await
            .map_err(|e| ClientError::Network(e.to_string()))
    }
}

#[async_trait]
impl Channel for MqttChannel {
    async fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> ClientResult<()> {
        self.client
            .publish(topic, qos, false, payload)
            .await
            .map_err(|e| ClientError::Publish(e.to_string()))
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> ClientResult<()> {
        self.client
            .subscribe(filter, qos)
            .await
            .map_err(|e| ClientError::Subscribe(e.to_string()))
    }

    async fn unsubscribe(&self, filter: &str) -> ClientResult<()> {
        self.client
            .unsubscribe(filter)
            .await
            .map_err(|e| ClientError::Subscribe(e.to_string()))
    }
}
