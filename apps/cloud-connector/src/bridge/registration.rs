//! Registration machine: one-shot enrollment via the deploy key, and the
//! per-connection register/ack handshake that gates all other traffic.

use std::time::Duration;

use bridge_proto::{
    topics, C2vBridgeMessage, ClusterInfo, Envelope, RegisterDeploymentRequest,
    RegisterVizierAck, RegisterVizierRequest, RegistrationStatus, V2cBridgeMessage,
};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::BridgeError;
use crate::transport::{BridgeConn, TransportError, VzConnClient};
use crate::vizier::VizierInfo;

pub(crate) const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Enrolls the cluster with the control plane and persists the assigned
/// identity. Called at most once per process lifetime, before any bridge
/// frame is sent.
pub(crate) async fn enroll(
    client: &dyn VzConnClient,
    vz_info: &dyn VizierInfo,
    deploy_key: &str,
) -> Result<Uuid, BridgeError> {
    let cluster_info = vz_info.cluster_info().await?;
    let request = RegisterDeploymentRequest {
        k8s_cluster_uid: cluster_info.cluster_uid,
        k8s_cluster_name: cluster_info.cluster_name,
        k8s_cluster_version: cluster_info.cluster_version,
    };
    let response = client
        .register_deployment(&request, deploy_key)
        .await
        .map_err(BridgeError::EnrollmentRejected)?;
    info!(vizier_id = %response.vizier_id, "enrolled vizier deployment");
    vz_info.persist_cluster_id(response.vizier_id).await?;
    Ok(response.vizier_id)
}

/// Sends the register frame directly on the stream (the writer is still
/// gated) and waits for the ack on the shared inbound channel.
pub(crate) async fn handshake(
    conn: &dyn BridgeConn,
    in_rx: &mut mpsc::Receiver<C2vBridgeMessage>,
    vizier_id: Uuid,
    jwt_key: &str,
    session_id: i64,
    vz_info: &dyn VizierInfo,
) -> Result<(), BridgeError> {
    let address = match vz_info.address().await {
        Ok((address, _port)) => address,
        Err(err) => {
            error!(error = %err, "unable to get vizier proxy address");
            String::new()
        }
    };
    let cluster_info = match vz_info.cluster_info().await {
        Ok(info) => info,
        Err(err) => {
            error!(error = %err, "unable to get cluster info");
            ClusterInfo::default()
        }
    };

    let request = RegisterVizierRequest {
        vizier_id,
        jwt_key: jwt_key.to_string(),
        address,
        cluster_info,
    };
    let frame = V2cBridgeMessage {
        topic: topics::REGISTER.to_string(),
        session_id,
        msg: Envelope::pack(&request)?,
    };
    conn.send(frame).await.map_err(BridgeError::StreamWrite)?;

    let deadline = tokio::time::Instant::now() + REGISTRATION_TIMEOUT;
    loop {
        let frame = match tokio::time::timeout_at(deadline, in_rx.recv()).await {
            Err(_) => {
                error!("timed out waiting for registration ack, terminating stream");
                return Err(BridgeError::RegistrationTimeout);
            }
            Ok(None) => return Err(BridgeError::StreamRead(TransportError::Closed)),
            Ok(Some(frame)) => frame,
        };
        if frame.topic != topics::REGISTER_ACK {
            warn!(topic = %frame.topic, "unexpected message while waiting for registration ack");
            continue;
        }

        let ack: RegisterVizierAck = frame.msg.unpack()?;
        return match ack.status {
            RegistrationStatus::Ok => Ok(()),
            RegistrationStatus::FailedNotFound => Err(BridgeError::ClusterUnknown),
            RegistrationStatus::Failed => Err(BridgeError::RegistrationRejected(
                "control plane returned a failure status".to_string(),
            )),
        };
    }
}
