//! The work queue seam: accepted queue records are announced to the
//! deliverers as one JSON payload per record on the configured topic.

#[async_trait::async_trait]
pub trait QueuePublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> anyhow::Result<()>;
}

/// NATS backed publisher.
pub struct NatsPublisher {
    client: async_nats::Client,
}

impl NatsPublisher {
    pub async fn connect(server: &str) -> anyhow::Result<Self> {
        let client = async_nats::connect(server)
            .await
            .map_err(|e| anyhow::anyhow!("cannot reach nats server '{}': {}", server, e))?;
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl QueuePublisher for NatsPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> anyhow::Result<()> {
        self.client
            .publish(topic.to_string(), bytes::Bytes::from(payload))
            .await
            .map_err(|e| anyhow::anyhow!("publish on '{}' failed: {}", topic, e))?;
        self.client
            .flush()
            .await
            .map_err(|e| anyhow::anyhow!("nats flush failed: {}", e))
    }
}
