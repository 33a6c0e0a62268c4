//! Shared harness for bridge integration tests: an in-memory bus, a scripted
//! control plane, and a scripted orchestrator.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bridge_proto::{topics, ClusterInfo, Envelope, RegistrationStatus, RegisterVizierAck, V2cBridgeMessage, V2cMessage};
use bytes::Bytes;
use cloud_connector::bridge::Bridge;
use cloud_connector::bus::{LocalBus, MessageBus};
use cloud_connector::config::Config;
use cloud_connector::error::BridgeError;
use cloud_connector::transport::mock::MockVzConn;
use cloud_connector::transport::pair::CloudEnd;
use cloud_connector::vizier::{
    HealthObservation, JobManifest, JobSummary, VizierError, VizierHealthChecker, VizierInfo,
    WorkloadState,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RenderCall {
    pub image_tags: HashMap<String, String>,
    pub env_substitutions: HashMap<String, String>,
}

#[derive(Default)]
struct MockState {
    existing_job: bool,
    fail_next_launch: bool,
    render_calls: Vec<RenderCall>,
    launched_jobs: Vec<JobManifest>,
    secrets: HashMap<String, HashMap<String, String>>,
    deleted_jobs: Vec<String>,
    persisted_id: Option<Uuid>,
}

/// Scripted orchestrator. Records every mutation and lets the test decide
/// when (and how) the updater job terminates.
pub struct MockVizierInfo {
    state: parking_lot::Mutex<MockState>,
    job_done_tx: watch::Sender<Option<bool>>,
}

impl MockVizierInfo {
    pub fn new() -> Arc<Self> {
        let (job_done_tx, _) = watch::channel(None);
        Arc::new(Self {
            state: parking_lot::Mutex::new(MockState::default()),
            job_done_tx,
        })
    }

    /// Pretends an updater job was already live when the bridge started.
    pub fn set_existing_job(&self) {
        self.state.lock().existing_job = true;
    }

    /// Makes the next job launch fail.
    pub fn fail_next_launch(&self) {
        self.state.lock().fail_next_launch = true;
    }

    /// Terminates the updater job with the given success predicate.
    pub fn complete_job(&self, success: bool) {
        let _ = self.job_done_tx.send(Some(success));
    }

    pub fn render_calls(&self) -> Vec<RenderCall> {
        self.state.lock().render_calls.clone()
    }

    pub fn launched_jobs(&self) -> Vec<JobManifest> {
        self.state.lock().launched_jobs.clone()
    }

    pub fn secret(&self, name: &str) -> Option<HashMap<String, String>> {
        self.state.lock().secrets.get(name).cloned()
    }

    pub fn deleted_jobs(&self) -> Vec<String> {
        self.state.lock().deleted_jobs.clone()
    }

    pub fn persisted_id(&self) -> Option<Uuid> {
        self.state.lock().persisted_id
    }
}

#[async_trait]
impl VizierInfo for MockVizierInfo {
    async fn address(&self) -> Result<(String, i32), VizierError> {
        Ok(("10.1.2.3".to_string(), 4000))
    }

    async fn cluster_info(&self) -> Result<ClusterInfo, VizierError> {
        Ok(ClusterInfo {
            cluster_uid: "cluster-uid".to_string(),
            cluster_name: "test-cluster".to_string(),
            cluster_version: "1.29".to_string(),
        })
    }

    async fn workload_state(&self) -> WorkloadState {
        WorkloadState {
            pod_statuses: HashMap::new(),
            num_nodes: 3,
            last_updated: Some(SystemTime::now()),
        }
    }

    async fn render_job(
        &self,
        template: &str,
        image_tags: &HashMap<String, String>,
        env_substitutions: &HashMap<String, String>,
    ) -> Result<JobManifest, VizierError> {
        let mut yaml = template.to_string();
        for (key, value) in env_substitutions {
            yaml = yaml.replace(&format!("__{key}__"), value);
        }
        for (container, tag) in image_tags {
            yaml = yaml.replace(
                &format!("__VIZIER_{}_IMAGE_TAG__", container.to_uppercase()),
                tag,
            );
        }
        self.state.lock().render_calls.push(RenderCall {
            image_tags: image_tags.clone(),
            env_substitutions: env_substitutions.clone(),
        });
        Ok(JobManifest { yaml })
    }

    async fn launch_job(&self, job: &JobManifest) -> Result<(), VizierError> {
        let mut state = self.state.lock();
        if state.fail_next_launch {
            state.fail_next_launch = false;
            return Err(VizierError::Request("job launch refused".to_string()));
        }
        state.launched_jobs.push(job.clone());
        state.existing_job = true;
        Ok(())
    }

    async fn get_job(&self, name: &str) -> Result<Option<JobSummary>, VizierError> {
        if self.state.lock().existing_job {
            Ok(Some(JobSummary {
                name: name.to_string(),
            }))
        } else {
            Ok(None)
        }
    }

    async fn wait_job_completion(&self, _name: &str) -> Result<bool, VizierError> {
        let mut rx = self.job_done_tx.subscribe();
        loop {
            if let Some(success) = *rx.borrow() {
                return Ok(success);
            }
            if rx.changed().await.is_err() {
                return Err(VizierError::Request("job watch ended".to_string()));
            }
        }
    }

    async fn delete_job(&self, name: &str) -> Result<(), VizierError> {
        let mut state = self.state.lock();
        state.deleted_jobs.push(name.to_string());
        state.existing_job = false;
        Ok(())
    }

    async fn create_secret(
        &self,
        name: &str,
        data: HashMap<String, String>,
    ) -> Result<(), VizierError> {
        self.state.lock().secrets.insert(name.to_string(), data);
        Ok(())
    }

    async fn cluster_uid(&self) -> Result<String, VizierError> {
        Ok("cluster-uid".to_string())
    }

    async fn persist_cluster_id(&self, id: Uuid) -> Result<(), VizierError> {
        self.state.lock().persisted_id = Some(id);
        Ok(())
    }
}

/// Health checker whose observation the test sets directly.
pub struct FakeHealthChecker {
    observation: parking_lot::Mutex<HealthObservation>,
}

impl FakeHealthChecker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            observation: parking_lot::Mutex::new(HealthObservation::default()),
        })
    }

    pub fn set_healthy(&self) {
        *self.observation.lock() = HealthObservation {
            observed_at: Some(std::time::Instant::now()),
            error: None,
        };
    }

    pub fn set_error(&self, message: &str) {
        *self.observation.lock() = HealthObservation {
            observed_at: Some(std::time::Instant::now()),
            error: Some(message.to_string()),
        };
    }
}

impl VizierHealthChecker for FakeHealthChecker {
    fn status(&self) -> HealthObservation {
        self.observation.lock().clone()
    }
}

pub struct TestBridge {
    pub bridge: Arc<Bridge>,
    pub bus: Arc<LocalBus>,
    pub client: Arc<MockVzConn>,
    pub accepted: mpsc::UnboundedReceiver<CloudEnd>,
    pub vz_info: Arc<MockVizierInfo>,
    pub checker: Arc<FakeHealthChecker>,
    pub stalled: Arc<AtomicBool>,
    pub run_handle: JoinHandle<Result<(), BridgeError>>,
}

impl TestBridge {
    /// Flips the quit channel and waits for the supervisor to finish.
    pub async fn shutdown(self) -> Result<(), BridgeError> {
        self.bridge.stop();
        self.run_handle.await.expect("bridge task panicked")
    }
}

pub fn test_config(vizier_id: Option<Uuid>) -> Config {
    Config {
        vizier_id,
        jwt_signing_key: "test-signing-key".to_string(),
        deploy_key: "dk1".to_string(),
        session_id: 42,
        bootstrap_mode: false,
        bootstrap_version: String::new(),
    }
}

/// Builds and starts a bridge wired to in-memory collaborators. The checker
/// starts healthy so heartbeats report HEALTHY by default.
pub fn start_bridge(config: Config) -> TestBridge {
    let bus = Arc::new(LocalBus::new());
    let (client, accepted) = MockVzConn::new();
    let vz_info = MockVizierInfo::new();
    let checker = FakeHealthChecker::new();
    checker.set_healthy();

    let stalled = Arc::new(AtomicBool::new(false));
    let stall_flag = stalled.clone();
    let bridge = Arc::new(
        Bridge::new(
            config,
            client.clone(),
            vz_info.clone(),
            bus.clone(),
            checker.clone(),
        )
        .with_stall_action(Box::new(move || {
            stall_flag.store(true, Ordering::SeqCst);
        })),
    );

    let runner = bridge.clone();
    let run_handle = tokio::spawn(async move { runner.run().await });

    TestBridge {
        bridge,
        bus,
        client,
        accepted,
        vz_info,
        checker,
        stalled,
        run_handle,
    }
}

/// An opaque envelope for relay tests; the bridge must not interpret it.
pub fn opaque_envelope(tag: &str) -> Envelope {
    Envelope {
        type_url: format!("test.{tag}"),
        body: Bytes::from(tag.as_bytes().to_vec()),
    }
}

/// Publishes a wrapped payload on the local bus the way in-cluster services
/// do.
pub async fn publish_v2c(bus: &LocalBus, topic: &str, msg: Envelope) {
    let payload = V2cMessage { msg }.to_bytes().expect("encode v2c wrapper");
    bus.publish(&topics::v2c_subject(topic), payload)
        .await
        .expect("bus publish");
}

/// Reads frames until the register frame shows up, then acks it with the
/// given status. Returns the frames that arrived before the register frame.
pub async fn ack_registration(
    cloud: &mut CloudEnd,
    status: RegistrationStatus,
) -> Vec<V2cBridgeMessage> {
    let mut before = Vec::new();
    loop {
        let frame = cloud.recv().await.expect("stream ended before register");
        if frame.topic == topics::REGISTER {
            let ack = Envelope::pack(&RegisterVizierAck { status }).expect("encode ack");
            assert!(cloud.send(topics::REGISTER_ACK, ack).await);
            return before;
        }
        before.push(frame);
    }
}

/// Next frame with the given topic, skipping everything else.
pub async fn next_frame_on(cloud: &mut CloudEnd, topic: &str) -> V2cBridgeMessage {
    loop {
        let frame = cloud.recv().await.expect("stream ended");
        if frame.topic == topic {
            return frame;
        }
    }
}
