//! In-memory bridge stream pair.
//!
//! [`pair`] returns the vizier-side connection and a [`CloudEnd`] handle that
//! lets a test (or an embedded harness) play the control plane: observe
//! outbound frames, inject inbound frames, stall or fail the link.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bridge_proto::{C2vBridgeMessage, Envelope, V2cBridgeMessage};
use tokio::sync::{mpsc, watch, Mutex};

use super::{BridgeConn, TransportError};

const PAIR_CAPACITY: usize = 256;

struct Shared {
    failed: AtomicBool,
    done_tx: watch::Sender<bool>,
}

pub struct PairConn {
    shared: Arc<Shared>,
    out_tx: mpsc::Sender<V2cBridgeMessage>,
    in_rx: Mutex<mpsc::Receiver<C2vBridgeMessage>>,
    gate_rx: watch::Receiver<bool>,
    done_rx: watch::Receiver<bool>,
}

/// Control-plane side of an in-memory stream.
pub struct CloudEnd {
    shared: Arc<Shared>,
    from_vizier: mpsc::Receiver<V2cBridgeMessage>,
    to_vizier: Option<mpsc::Sender<C2vBridgeMessage>>,
    gate_tx: watch::Sender<bool>,
}

pub fn pair() -> (Arc<PairConn>, CloudEnd) {
    let (out_tx, from_vizier) = mpsc::channel(PAIR_CAPACITY);
    let (to_vizier, in_rx) = mpsc::channel(PAIR_CAPACITY);
    let (gate_tx, gate_rx) = watch::channel(true);
    let (done_tx, done_rx) = watch::channel(false);

    let shared = Arc::new(Shared {
        failed: AtomicBool::new(false),
        done_tx,
    });

    let conn = Arc::new(PairConn {
        shared: shared.clone(),
        out_tx,
        in_rx: Mutex::new(in_rx),
        gate_rx,
        done_rx,
    });
    let cloud = CloudEnd {
        shared,
        from_vizier,
        to_vizier: Some(to_vizier),
        gate_tx,
    };
    (conn, cloud)
}

#[async_trait]
impl BridgeConn for PairConn {
    async fn send(&self, msg: V2cBridgeMessage) -> Result<(), TransportError> {
        let mut gate = self.gate_rx.clone();
        while !*gate.borrow() {
            if gate.changed().await.is_err() {
                return Err(TransportError::Closed);
            }
        }
        if self.shared.failed.load(Ordering::Acquire) {
            return Err(TransportError::Send("link failed".into()));
        }
        self.out_tx
            .send(msg)
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn recv(&self) -> Result<Option<C2vBridgeMessage>, TransportError> {
        let mut rx = self.in_rx.lock().await;
        Ok(rx.recv().await)
    }

    async fn close_send(&self) {
        // The cloud end observes end-of-send when the sender count drops, so
        // nothing to do for a channel-backed pair beyond marking the link.
    }

    fn done(&self) -> watch::Receiver<bool> {
        self.done_rx.clone()
    }
}

impl CloudEnd {
    /// Next frame sent by the vizier, in order. `None` once the vizier side
    /// has shut down.
    pub async fn recv(&mut self) -> Option<V2cBridgeMessage> {
        self.from_vizier.recv().await
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<V2cBridgeMessage> {
        self.from_vizier.try_recv().ok()
    }

    /// Injects an inbound frame. Returns `false` once the vizier side is gone.
    pub async fn send(&self, topic: &str, msg: Envelope) -> bool {
        let frame = C2vBridgeMessage {
            topic: topic.to_string(),
            msg,
        };
        match &self.to_vizier {
            Some(tx) => tx.send(frame).await.is_ok(),
            None => false,
        }
    }

    /// Makes every subsequent vizier-side send fail without closing the
    /// inbound direction. The frame that hits the failure is not delivered.
    pub fn fail_link(&self) {
        self.shared.failed.store(true, Ordering::Release);
    }

    /// Parks vizier-side sends until [`release_sends`](Self::release_sends).
    pub fn hold_sends(&self) {
        let _ = self.gate_tx.send(false);
    }

    pub fn release_sends(&self) {
        let _ = self.gate_tx.send(true);
    }

    /// Cancels the stream: sends fail, inbound reaches end-of-stream, and the
    /// connection's done watch flips.
    pub fn close(&mut self) {
        self.shared.failed.store(true, Ordering::Release);
        self.to_vizier = None;
        // A parked sender must wake up to observe the failure.
        let _ = self.gate_tx.send(true);
        let _ = self.shared.done_tx.send(true);
    }
}
