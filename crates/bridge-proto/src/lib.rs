//! Shared wire contract between a vizier's cloud connector and the control
//! plane. Keeping this in a dedicated crate lets cloud-side tooling and test
//! harnesses speak the bridge protocol without pulling in the daemon.

use std::collections::HashMap;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod topics;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode {type_url}: {source}")]
    Encode {
        type_url: &'static str,
        source: serde_json::Error,
    },
    #[error("failed to decode {type_url}: {source}")]
    Decode {
        type_url: String,
        source: serde_json::Error,
    },
    #[error("payload type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        expected: &'static str,
        actual: String,
    },
    #[error("malformed wrapper message: {0}")]
    Malformed(String),
}

/// A payload type that can travel inside an [`Envelope`].
pub trait TypedMessage: Serialize + DeserializeOwned {
    const TYPE_URL: &'static str;
}

/// Opaque typed payload carried by bridge and bus messages. The bridge relays
/// envelopes without inspecting them except for the well-known control topics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub type_url: String,
    pub body: Bytes,
}

impl Envelope {
    pub fn pack<M: TypedMessage>(msg: &M) -> Result<Self, CodecError> {
        let body = serde_json::to_vec(msg).map_err(|source| CodecError::Encode {
            type_url: M::TYPE_URL,
            source,
        })?;
        Ok(Self {
            type_url: M::TYPE_URL.to_string(),
            body: Bytes::from(body),
        })
    }

    pub fn unpack<M: TypedMessage>(&self) -> Result<M, CodecError> {
        if self.type_url != M::TYPE_URL {
            return Err(CodecError::TypeMismatch {
                expected: M::TYPE_URL,
                actual: self.type_url.clone(),
            });
        }
        serde_json::from_slice(&self.body).map_err(|source| CodecError::Decode {
            type_url: self.type_url.clone(),
            source,
        })
    }
}

/// Frame sent vizier → cloud on the bridge stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct V2cBridgeMessage {
    pub topic: String,
    pub session_id: i64,
    pub msg: Envelope,
}

/// Frame sent cloud → vizier on the bridge stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct C2vBridgeMessage {
    pub topic: String,
    pub msg: Envelope,
}

/// Wrapper for messages published by in-cluster services on `v2c.<topic>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct V2cMessage {
    pub msg: Envelope,
}

/// Wrapper for cloud messages republished on `c2v.<topic>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct C2vMessage {
    pub vizier_id: String,
    pub msg: Envelope,
}

impl V2cMessage {
    pub fn to_bytes(&self) -> Result<Bytes, CodecError> {
        encode_wrapper(self, "V2cMessage")
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self, CodecError> {
        decode_wrapper(raw, "V2cMessage")
    }
}

impl C2vMessage {
    pub fn to_bytes(&self) -> Result<Bytes, CodecError> {
        encode_wrapper(self, "C2vMessage")
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self, CodecError> {
        decode_wrapper(raw, "C2vMessage")
    }
}

fn encode_wrapper<T: Serialize>(msg: &T, name: &str) -> Result<Bytes, CodecError> {
    serde_json::to_vec(msg)
        .map(Bytes::from)
        .map_err(|err| CodecError::Malformed(format!("{name}: {err}")))
}

fn decode_wrapper<T: DeserializeOwned>(raw: &[u8], name: &str) -> Result<T, CodecError> {
    serde_json::from_slice(raw).map_err(|err| CodecError::Malformed(format!("{name}: {err}")))
}

/// Cluster metadata reported during enrollment and registration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub cluster_uid: String,
    pub cluster_name: String,
    pub cluster_version: String,
}

/// Per-connection registration request, sent on the `register` topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterVizierRequest {
    pub vizier_id: Uuid,
    pub jwt_key: String,
    pub address: String,
    pub cluster_info: ClusterInfo,
}

impl TypedMessage for RegisterVizierRequest {
    const TYPE_URL: &'static str = "cloud.vizier.RegisterVizierRequest";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegistrationStatus {
    Ok,
    FailedNotFound,
    #[serde(other)]
    Failed,
}

/// Cloud's answer to `register`, delivered on the `registerAck` topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterVizierAck {
    pub status: RegistrationStatus,
}

impl TypedMessage for RegisterVizierAck {
    const TYPE_URL: &'static str = "cloud.vizier.RegisterVizierAck";
}

/// One-shot enrollment request, authenticated by the deploy key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterDeploymentRequest {
    pub k8s_cluster_uid: String,
    pub k8s_cluster_name: String,
    pub k8s_cluster_version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterDeploymentResponse {
    pub vizier_id: Uuid,
}

/// Aggregate cluster status carried in heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VizierStatus {
    Unknown,
    Healthy,
    Unhealthy,
    Updating,
    UpdateFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodStatus {
    pub name: String,
    pub status: PodPhase,
    #[serde(default)]
    pub message: String,
}

/// Periodic liveness frame, sent on the `heartbeat` topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VizierHeartbeat {
    pub vizier_id: Uuid,
    pub time_ns: i64,
    pub sequence_number: i64,
    pub address: String,
    pub port: i32,
    pub num_nodes: i32,
    pub pod_statuses: HashMap<String, PodStatus>,
    pub pod_statuses_last_updated_ns: i64,
    pub status: VizierStatus,
    pub bootstrap_mode: bool,
    pub bootstrap_version: String,
}

impl TypedMessage for VizierHeartbeat {
    const TYPE_URL: &'static str = "cloud.vizier.VizierHeartbeat";
}

/// Update command delivered by the cloud on the `VizierUpdate` topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateOrInstallVizierRequest {
    pub version: String,
    pub token: String,
    #[serde(default)]
    pub redeploy_etcd: bool,
}

impl TypedMessage for UpdateOrInstallVizierRequest {
    const TYPE_URL: &'static str = "cloud.vizier.UpdateOrInstallVizierRequest";
}

/// Acknowledgement published on `VizierUpdateResponse` once the updater job
/// has been launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateOrInstallVizierResponse {
    pub update_started: bool,
}

impl TypedMessage for UpdateOrInstallVizierResponse {
    const TYPE_URL: &'static str = "cloud.vizier.UpdateOrInstallVizierResponse";
}
