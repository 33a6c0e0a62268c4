//! Update controller: reacts to `VizierUpdate` commands by launching the
//! in-cluster updater job, and tracks the job's lifecycle in a pair of flags
//! the heartbeat generator reads.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bridge_proto::{
    topics, Envelope, UpdateOrInstallVizierRequest, UpdateOrInstallVizierResponse, V2cMessage,
};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::bus::MessageBus;
use crate::vizier::VizierInfo;

pub(crate) const UPGRADE_JOB_NAME: &str = "vizier-upgrade-job";
const UPDATE_JOB_SECRETS: &str = "pl-update-job-secrets";
const CLOUD_TOKEN_KEY: &str = "cloud-token";

/// Manifest applied for the updater job. Markers are expanded by the
/// orchestrator's renderer.
pub(crate) const UPDATER_JOB_YAML: &str = r#"---
apiVersion: batch/v1
kind: Job
metadata:
  name: vizier-upgrade-job
spec:
  template:
    metadata:
      name: vizier-upgrade-job
    spec:
      serviceAccountName: updater-service-account
      containers:
      - name: updater
        image: gcr.io/pl-dev-infra/vizier/vizier_updater_image:__VIZIER_UPDATER_IMAGE_TAG__
        envFrom:
        - configMapRef:
            name: pl-cloud-config
        env:
        - name: PL_CLOUD_TOKEN
          valueFrom:
            secretKeyRef:
              name: pl-update-job-secrets
              key: cloud-token
        - name: PL_VIZIER_VERSION
          value: __PL_VIZIER_VERSION__
        - name: PL_REDEPLOY_ETCD
          value: __PL_REDEPLOY_ETCD__
        - name: PL_CLIENT_TLS_CERT
          value: /certs/client.crt
        - name: PL_CLIENT_TLS_KEY
          value: /certs/client.key
        - name: PL_SERVER_TLS_CERT
          value: /certs/server.crt
        - name: PL_SERVER_TLS_KEY
          value: /certs/server.key
        - name: PL_TLS_CA_CERT
          value: /certs/ca.crt
        volumeMounts:
        - name: certs
          mountPath: /certs
      imagePullSecrets:
      - name: pl-image-secret
      volumes:
      - name: certs
        secret:
          secretName: service-tls-certs
      restartPolicy: "Never"
  backoffLimit: 1
  parallelism: 1
  completions: 1"#;

#[derive(Debug, Error)]
pub(crate) enum UpdateError {
    #[error("could not decode update request: {0}")]
    Decode(bridge_proto::CodecError),
    #[error("could not render updater job: {0}")]
    Render(crate::vizier::VizierError),
    #[error("failed to create job secrets: {0}")]
    Secret(crate::vizier::VizierError),
    #[error("could not launch updater job: {0}")]
    Launch(crate::vizier::VizierError),
    #[error("failed to publish update response: {0}")]
    Ack(String),
}

/// `running` covers command acceptance through job termination; `failed` is
/// sticky once a terminated job's success predicate is false.
#[derive(Debug, Default)]
pub struct UpdateState {
    running: AtomicBool,
    failed: AtomicBool,
}

impl UpdateState {
    pub fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub(crate) fn set_running(&self, value: bool) {
        self.running.store(value, Ordering::Release);
    }

    pub(crate) fn set_failed(&self, value: bool) {
        self.failed.store(value, Ordering::Release);
    }
}

pub(crate) struct UpdateController {
    vz_info: Arc<dyn VizierInfo>,
    bus: Arc<dyn MessageBus>,
    state: Arc<UpdateState>,
}

impl UpdateController {
    pub(crate) fn new(
        vz_info: Arc<dyn VizierInfo>,
        bus: Arc<dyn MessageBus>,
        state: Arc<UpdateState>,
    ) -> Self {
        Self {
            vz_info,
            bus,
            state,
        }
    }

    /// Handles one `VizierUpdate` command. Failures abort the update without
    /// tearing down the connection.
    pub(crate) async fn handle_update_request(&self, msg: &Envelope) -> Result<(), UpdateError> {
        let request: UpdateOrInstallVizierRequest =
            msg.unpack().map_err(UpdateError::Decode)?;
        info!(version = %request.version, "starting vizier update");

        self.state.set_running(true);
        match self.launch(&request).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.state.set_failed(true);
                self.state.set_running(false);
                Err(err)
            }
        }
    }

    async fn launch(&self, request: &UpdateOrInstallVizierRequest) -> Result<(), UpdateError> {
        let image_tags = HashMap::from([("updater".to_string(), request.version.clone())]);
        let env_substitutions = HashMap::from([
            (
                "PL_VIZIER_VERSION".to_string(),
                request.version.clone(),
            ),
            (
                "PL_REDEPLOY_ETCD".to_string(),
                request.redeploy_etcd.to_string(),
            ),
        ]);
        let job = self
            .vz_info
            .render_job(UPDATER_JOB_YAML, &image_tags, &env_substitutions)
            .await
            .map_err(UpdateError::Render)?;

        self.vz_info
            .create_secret(
                UPDATE_JOB_SECRETS,
                HashMap::from([(CLOUD_TOKEN_KEY.to_string(), request.token.clone())]),
            )
            .await
            .map_err(UpdateError::Secret)?;

        self.vz_info
            .launch_job(&job)
            .await
            .map_err(UpdateError::Launch)?;

        self.spawn_completion_watcher();

        let response = Envelope::pack(&UpdateOrInstallVizierResponse {
            update_started: true,
        })
        .map_err(|err| UpdateError::Ack(err.to_string()))?;
        let payload = V2cMessage { msg: response }
            .to_bytes()
            .map_err(|err| UpdateError::Ack(err.to_string()))?;
        self.bus
            .publish(&topics::v2c_subject(topics::VIZIER_UPDATE_RESPONSE), payload)
            .await
            .map_err(|err| UpdateError::Ack(err.to_string()))
    }

    /// Startup probe: if an updater job is already live, adopt it.
    pub(crate) async fn resume_existing(&self) -> Result<bool, crate::vizier::VizierError> {
        match self.vz_info.get_job(UPGRADE_JOB_NAME).await? {
            Some(_) => {
                info!("found a running upgrade job, watching it");
                self.state.set_running(true);
                self.spawn_completion_watcher();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn spawn_completion_watcher(&self) -> JoinHandle<()> {
        let vz_info = self.vz_info.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            let success = match vz_info.wait_job_completion(UPGRADE_JOB_NAME).await {
                Ok(success) => success,
                Err(err) => {
                    error!(error = %err, "error while watching the upgrade job");
                    state.set_running(false);
                    return;
                }
            };
            state.set_failed(!success);
            if let Err(err) = vz_info.delete_job(UPGRADE_JOB_NAME).await {
                error!(error = %err, "error deleting the upgrade job");
            }
            state.set_running(false);
        })
    }
}
