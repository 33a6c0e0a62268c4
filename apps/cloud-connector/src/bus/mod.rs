//! Local message bus abstraction.
//!
//! The bridge relays between this bus and the cloud stream. In production the
//! bus is NATS ([`nats::NatsBus`]); [`LocalBus`] is an in-memory substitute
//! for tests and single-process setups.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod nats;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub subject: String,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus connection failed: {0}")]
    Connect(String),
    #[error("bus subscribe failed for {subject}: {reason}")]
    Subscribe { subject: String, reason: String },
    #[error("bus publish failed for {subject}: {reason}")]
    Publish { subject: String, reason: String },
    #[error("bus subscription closed")]
    Closed,
}

/// Pub/sub surface the bridge needs: wildcard subscription feeding a bounded
/// channel, and fire-and-forget publishes.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn subscribe(&self, subject: &str) -> Result<mpsc::Receiver<BusMessage>, BusError>;
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError>;
}

const DEFAULT_CAPACITY: usize = 4096;

/// Simple in-memory bus for tests and non-NATS contexts. Supports the same
/// single-token `*` wildcard NATS subjects use.
pub struct LocalBus {
    capacity: usize,
    subscriptions: parking_lot::Mutex<Vec<Subscription>>,
}

struct Subscription {
    pattern: String,
    tx: mpsc::Sender<BusMessage>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            subscriptions: parking_lot::Mutex::new(Vec::new()),
        }
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn subscribe(&self, subject: &str) -> Result<mpsc::Receiver<BusMessage>, BusError> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.subscriptions.lock().push(Subscription {
            pattern: subject.to_string(),
            tx,
        });
        Ok(rx)
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError> {
        let mut subs = self.subscriptions.lock();
        subs.retain(|sub| !sub.tx.is_closed());
        for sub in subs.iter() {
            if subject_matches(&sub.pattern, subject) {
                // Fire-and-forget: a full or closed subscriber drops the message.
                let _ = sub.tx.try_send(BusMessage {
                    subject: subject.to_string(),
                    payload: payload.clone(),
                });
            }
        }
        Ok(())
    }
}

fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (None, None) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_bus_round_trip() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe("v2c.heartbeat").await.unwrap();
        bus.publish("v2c.heartbeat", Bytes::from_static(b"ping"))
            .await
            .unwrap();
        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.subject, "v2c.heartbeat");
        assert_eq!(msg.payload, Bytes::from_static(b"ping"));
    }

    #[tokio::test]
    async fn wildcard_matches_one_token() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe("v2c.*").await.unwrap();
        bus.publish("v2c.reply-3f1a", Bytes::from_static(b"a"))
            .await
            .unwrap();
        bus.publish("c2v.other", Bytes::from_static(b"b"))
            .await
            .unwrap();
        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.subject, "v2c.reply-3f1a");
        assert!(sub.try_recv().is_err());
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fire_and_forget() {
        let bus = LocalBus::new();
        bus.publish("v2c.none", Bytes::from_static(b"x"))
            .await
            .unwrap();
    }

    #[test]
    fn subject_matching() {
        assert!(subject_matches("v2c.*", "v2c.heartbeat"));
        assert!(subject_matches("v2c.heartbeat", "v2c.heartbeat"));
        assert!(!subject_matches("v2c.*", "v2c.a.b"));
        assert!(!subject_matches("v2c.*", "c2v.a"));
        assert!(!subject_matches("v2c.*", "v2c"));
    }
}
