//! Relay from Redis pub/sub into the local cluster event channel

use futures::StreamExt;
use tokio::sync::broadcast;

use crate::config::RedisConfig;

use super::backoff::ReconnectBackoff;
use super::types::ClusterEvent;

/// Subscribes to the cluster event channel and republishes decoded events locally
pub struct RedisEventRelay {
    redis_url: String,
    backoff: ReconnectBackoff,
    channel: String,
    sender: broadcast::Sender<ClusterEvent>,
    shutdown: broadcast::Receiver<()>,
}

enum RelayExit {
    Shutdown,
    StreamEnded,
}

impl RedisEventRelay {
    pub fn new(
        redis: &RedisConfig,
        channel: impl Into<String>,
        sender: broadcast::Sender<ClusterEvent>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            redis_url: redis.url.clone(),
            backoff: ReconnectBackoff::from_config(redis),
            channel: channel.into(),
            sender,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        tracing::info!(channel = %self.channel, "Cluster event relay started");

        loop {
            match self.relay().await {
                Ok(RelayExit::Shutdown) => break,
                Ok(RelayExit::StreamEnded) => {
                    tracing::warn!(channel = %self.channel, "Cluster event stream ended, resubscribing");
                }
                Err(e) => {
                    let Some(delay) = self.backoff.on_failure() else {
                        tracing::error!(
                            error = %e,
                            attempts = self.backoff.failures(),
                            "Cluster event subscription failed, giving up; peers' changes will not be seen"
                        );
                        break;
                    };
                    tracing::error!(
                        error = %e,
                        attempt = self.backoff.failures(),
                        delay_ms = delay.as_millis() as u64,
                        "Cluster event subscription failed, reconnecting"
                    );
                    tokio::select! {
                        _ = self.shutdown.recv() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        tracing::info!("Cluster event relay stopped");
    }

    async fn relay(&mut self) -> anyhow::Result<RelayExit> {
        let client = redis::Client::open(self.redis_url.as_str())?;
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.subscribe(&self.channel).await?;
        self.backoff.on_connected();
        tracing::debug!(channel = %self.channel, "Subscribed to cluster events");

        let mut messages = pubsub.on_message();
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => return Ok(RelayExit::Shutdown),
                msg = messages.next() => {
                    let Some(msg) = msg else {
                        return Ok(RelayExit::StreamEnded);
                    };
                    let payload: String = match msg.get_payload() {
                        Ok(payload) => payload,
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to read cluster event payload");
                            continue;
                        }
                    };
                    match serde_json::from_str::<ClusterEvent>(&payload) {
                        Ok(event) => {
                            // No local subscribers is fine
                            let _ = self.sender.send(event);
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, payload = %payload, "Failed to parse cluster event");
                        }
                    }
                }
            }
        }
    }
}
