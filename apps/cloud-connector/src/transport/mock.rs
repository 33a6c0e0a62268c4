//! Scripted control-plane client used by tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bridge_proto::{RegisterDeploymentRequest, RegisterDeploymentResponse};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::pair::{pair, CloudEnd};
use super::{BridgeConn, TransportError, VzConnClient};

/// A [`VzConnClient`] whose every `connect` hands the cloud side of a fresh
/// in-memory pair to the test through an unbounded channel.
pub struct MockVzConn {
    accepted_tx: mpsc::UnboundedSender<CloudEnd>,
    enroll_response: parking_lot::Mutex<Option<RegisterDeploymentResponse>>,
    enroll_calls: AtomicUsize,
    connect_calls: AtomicUsize,
}

impl MockVzConn {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<CloudEnd>) {
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        let client = Arc::new(Self {
            accepted_tx,
            enroll_response: parking_lot::Mutex::new(None),
            enroll_calls: AtomicUsize::new(0),
            connect_calls: AtomicUsize::new(0),
        });
        (client, accepted_rx)
    }

    /// Arms the enrollment endpoint. Without a response configured, the call
    /// is rejected.
    pub fn set_enroll_response(&self, vizier_id: Uuid) {
        *self.enroll_response.lock() = Some(RegisterDeploymentResponse { vizier_id });
    }

    pub fn enroll_calls(&self) -> usize {
        self.enroll_calls.load(Ordering::Acquire)
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::Acquire)
    }
}

#[async_trait]
impl VzConnClient for MockVzConn {
    async fn connect(&self) -> Result<Arc<dyn BridgeConn>, TransportError> {
        self.connect_calls.fetch_add(1, Ordering::AcqRel);
        let (conn, cloud) = pair();
        self.accepted_tx
            .send(cloud)
            .map_err(|_| TransportError::Connect("mock acceptor dropped".into()))?;
        Ok(conn as Arc<dyn BridgeConn>)
    }

    async fn register_deployment(
        &self,
        _request: &RegisterDeploymentRequest,
        _deploy_key: &str,
    ) -> Result<RegisterDeploymentResponse, TransportError> {
        self.enroll_calls.fetch_add(1, Ordering::AcqRel);
        (*self.enroll_response.lock())
            .ok_or_else(|| TransportError::Enrollment("deploy key rejected".into()))
    }
}
