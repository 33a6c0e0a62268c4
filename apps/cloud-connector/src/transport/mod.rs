//! Transport abstraction for the bridge stream.
//!
//! The bidirectional RPC to the control plane is modelled as a pair of
//! one-way frame carriers behind [`BridgeConn`] so tests can substitute the
//! in-memory [`pair`] while production uses [`websocket`].

use std::sync::Arc;

use async_trait::async_trait;
use bridge_proto::{C2vBridgeMessage, RegisterDeploymentRequest, RegisterDeploymentResponse, V2cBridgeMessage};
use thiserror::Error;
use tokio::sync::watch;

pub mod mock;
pub mod pair;
pub mod websocket;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("receive failed: {0}")]
    Recv(String),
    #[error("stream closed")]
    Closed,
    #[error("enrollment call failed: {0}")]
    Enrollment(String),
}

/// One live bridge stream. `send`/`recv` are the two one-way carriers;
/// `done` resolves when the underlying connection is no longer usable.
#[async_trait]
pub trait BridgeConn: Send + Sync {
    async fn send(&self, msg: V2cBridgeMessage) -> Result<(), TransportError>;

    /// `Ok(None)` is a clean end-of-stream.
    async fn recv(&self) -> Result<Option<C2vBridgeMessage>, TransportError>;

    /// Signals end-of-send; the peer may still deliver inbound frames.
    async fn close_send(&self);

    /// Watch that flips to `true` once the connection is dead.
    fn done(&self) -> watch::Receiver<bool>;
}

/// Client for the control plane: opens bridge streams and performs the unary
/// enrollment exchange.
#[async_trait]
pub trait VzConnClient: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BridgeConn>, TransportError>;

    async fn register_deployment(
        &self,
        request: &RegisterDeploymentRequest,
        deploy_key: &str,
    ) -> Result<RegisterDeploymentResponse, TransportError>;
}
