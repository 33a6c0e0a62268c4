//! NATS-backed implementation of the local bus.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::trace;

use super::{BusError, BusMessage, MessageBus};

/// Pending-message limit for bridge subscriptions. Sized so that a transient
/// cloud disconnect does not back-pressure unrelated bus producers.
const SUBSCRIPTION_CAPACITY: usize = 10_000_000;

pub struct NatsBus {
    client: async_nats::Client,
}

impl NatsBus {
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client = async_nats::ConnectOptions::new()
            .subscription_capacity(SUBSCRIPTION_CAPACITY)
            .connect(url)
            .await
            .map_err(|err| BusError::Connect(err.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl MessageBus for NatsBus {
    async fn subscribe(&self, subject: &str) -> Result<mpsc::Receiver<BusMessage>, BusError> {
        trace!(subject, "subscribing to NATS");
        let mut sub = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|err| BusError::Subscribe {
                subject: subject.to_string(),
                reason: err.to_string(),
            })?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        tokio::spawn(async move {
            while let Some(msg) = sub.next().await {
                let forwarded = BusMessage {
                    subject: msg.subject.to_string(),
                    payload: msg.payload,
                };
                if tx.send(forwarded).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError> {
        self.client
            .publish(subject.to_string(), payload)
            .await
            .map_err(|err| BusError::Publish {
                subject: subject.to_string(),
                reason: err.to_string(),
            })
    }
}
