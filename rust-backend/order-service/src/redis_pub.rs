use redis::{AsyncCommands, Client, RedisError};
use tokio::time::{sleep, Duration};

use crate::events::OrderEvent;

const MAX_ATTEMPTS: u32 = 5;

#[derive(Clone)]
pub struct RedisPublisher {
    client: Option<Client>,
}

impl RedisPublisher {
    pub fn new(redis_url: &str) -> Result<Self, RedisError> {
        let client = Client::open(redis_url)?;
        Ok(Self { client: Some(client) })
    }

    /// Publisher for deployments without Redis; every publish is skipped.
    pub fn new_noop() -> Self {
        Self { client: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.client.is_some()
    }

    pub async fn publish(&self, channel: &str, event: &OrderEvent) -> Result<(), RedisError> {
        let Some(client) = &self.client else {
            tracing::debug!(channel, "redis publisher disabled, skipping publish");
            return Ok(());
        };

        let payload = serde_json::to_string(event).map_err(|e| {
            RedisError::from((redis::ErrorKind::TypeError, "serialization failed", e.to_string()))
        })?;

        let mut attempts = 0;
        loop {
            attempts += 1;
            let result = match client.get_multiplexed_async_connection().await {
                Ok(mut conn) => conn.publish::<_, _, i64>(channel, payload.clone()).await.map(|_| ()),
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => return Ok(()),
                Err(e) if attempts >= MAX_ATTEMPTS => {
                    tracing::error!(channel, attempts, error = %e, "redis publish failed");
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(channel, attempts, error = %e, "redis publish failed, retrying");
                }
            }

            sleep(Duration::from_secs(2)).await;
        }
    }

    /// Publishes off the request path; failures are only logged.
    pub fn emit(&self, event: OrderEvent) {
        if !self.is_enabled() {
            return;
        }
        let publisher = self.clone();
        tokio::spawn(async move {
            let channel = event.event_type.clone();
            if let Err(e) = publisher.publish(&channel, &event).await {
                tracing::error!(channel = %channel, error = %e, "dropping order event");
            }
        });
    }
}
