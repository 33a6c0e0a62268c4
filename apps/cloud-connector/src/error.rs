use thiserror::Error;

use crate::bus::BusError;
use crate::transport::TransportError;
use crate::vizier::VizierError;

/// Errors surfaced by the bridge supervisor. Registration and stream errors
/// tear down the current connection and trigger a reconnect; enrollment and
/// exhausted-backoff connect failures are fatal to the process.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("could not connect to the control plane: {0}")]
    ConnectFailed(#[source] TransportError),

    #[error("control plane rejected enrollment: {0}")]
    EnrollmentRejected(#[source] TransportError),

    #[error("timed out waiting for registration ack")]
    RegistrationTimeout,

    #[error("registration unsuccessful: {0}")]
    RegistrationRejected(String),

    #[error("cluster unknown to the control plane, re-deploy with a valid deploy key")]
    ClusterUnknown,

    #[error("stream read failed: {0}")]
    StreamRead(#[source] TransportError),

    #[error("stream write failed: {0}")]
    StreamWrite(#[source] TransportError),

    #[error("malformed message on bus subject {subject}: {reason}")]
    MalformedFrame { subject: String, reason: String },

    #[error("local bus failure: {0}")]
    Bus(#[from] BusError),

    #[error("orchestrator failure: {0}")]
    Vizier(#[from] VizierError),

    #[error("payload codec failure: {0}")]
    Codec(#[from] bridge_proto::CodecError),

    #[error("bridge already started")]
    AlreadyStarted,
}
