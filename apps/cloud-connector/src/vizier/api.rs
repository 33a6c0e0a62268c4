//! HTTP client for the in-cluster orchestrator API.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bridge_proto::{ClusterInfo, PodStatus};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;
use uuid::Uuid;

use super::{JobManifest, JobSummary, VizierError, VizierInfo, WorkloadState};

pub struct ApiVizierInfo {
    base_url: Url,
    http: reqwest::Client,
}

impl ApiVizierInfo {
    pub fn new(base_url: Url) -> Result<Self, VizierError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| VizierError::Request(err.to_string()))?;
        Ok(Self { base_url, http })
    }

    fn endpoint(&self, path: &str) -> Result<Url, VizierError> {
        self.base_url
            .join(path)
            .map_err(|err| VizierError::Request(format!("invalid endpoint {path}: {err}")))
    }
}

#[derive(Debug, Deserialize)]
struct AddressResponse {
    address: String,
    port: i32,
}

#[derive(Debug, Deserialize)]
struct WorkloadsResponse {
    #[serde(default)]
    pod_statuses: HashMap<String, PodStatus>,
    #[serde(default)]
    num_nodes: i32,
    #[serde(default)]
    last_updated_ns: Option<i64>,
}

#[derive(Debug, Serialize)]
struct LaunchJobRequest<'a> {
    yaml: &'a str,
}

#[derive(Debug, Deserialize)]
struct JobResponse {
    name: String,
}

#[derive(Debug, Deserialize)]
struct JobCompletionResponse {
    success: bool,
}

#[derive(Debug, Serialize)]
struct SecretRequest {
    data: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
struct ClusterIdRequest {
    vizier_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct ClusterUidResponse {
    cluster_uid: String,
}

#[async_trait]
impl VizierInfo for ApiVizierInfo {
    async fn address(&self) -> Result<(String, i32), VizierError> {
        let endpoint = self.endpoint("v1/cluster/address")?;
        let response: AddressResponse = get_json(&self.http, endpoint).await?;
        Ok((response.address, response.port))
    }

    async fn cluster_info(&self) -> Result<ClusterInfo, VizierError> {
        let endpoint = self.endpoint("v1/cluster/info")?;
        get_json(&self.http, endpoint).await
    }

    async fn workload_state(&self) -> WorkloadState {
        let endpoint = match self.endpoint("v1/cluster/workloads") {
            Ok(endpoint) => endpoint,
            Err(err) => {
                warn!(error = %err, "could not build workloads endpoint");
                return WorkloadState::default();
            }
        };
        match get_json::<WorkloadsResponse>(&self.http, endpoint).await {
            Ok(response) => WorkloadState {
                pod_statuses: response.pod_statuses,
                num_nodes: response.num_nodes,
                last_updated: response
                    .last_updated_ns
                    .map(|ns| UNIX_EPOCH + Duration::from_nanos(ns.max(0) as u64)),
            },
            Err(err) => {
                warn!(error = %err, "failed to fetch workload state");
                WorkloadState::default()
            }
        }
    }

    async fn render_job(
        &self,
        template: &str,
        image_tags: &HashMap<String, String>,
        env_substitutions: &HashMap<String, String>,
    ) -> Result<JobManifest, VizierError> {
        let yaml = expand_template(template, image_tags, env_substitutions)?;
        Ok(JobManifest { yaml })
    }

    async fn launch_job(&self, job: &JobManifest) -> Result<(), VizierError> {
        let endpoint = self.endpoint("v1/jobs")?;
        let response = self
            .http
            .post(endpoint)
            .json(&LaunchJobRequest { yaml: &job.yaml })
            .send()
            .await
            .map_err(|err| VizierError::Request(err.to_string()))?;
        check_status(response.status(), "job launch")
    }

    async fn get_job(&self, name: &str) -> Result<Option<JobSummary>, VizierError> {
        let endpoint = self.endpoint(&format!("v1/jobs/{name}"))?;
        let response = self
            .http
            .get(endpoint)
            .send()
            .await
            .map_err(|err| VizierError::Request(err.to_string()))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        check_status(response.status(), "job lookup")?;
        let job: JobResponse = response
            .json()
            .await
            .map_err(|err| VizierError::Request(err.to_string()))?;
        Ok(Some(JobSummary { name: job.name }))
    }

    async fn wait_job_completion(&self, name: &str) -> Result<bool, VizierError> {
        // The orchestrator long-polls; retry until the job terminates.
        loop {
            let endpoint = self.endpoint(&format!("v1/jobs/{name}/completion"))?;
            let response = self
                .http
                .get(endpoint)
                .send()
                .await
                .map_err(|err| VizierError::Request(err.to_string()))?;
            if response.status() == StatusCode::REQUEST_TIMEOUT {
                continue;
            }
            if response.status() == StatusCode::NOT_FOUND {
                return Err(VizierError::NotFound(format!("job {name}")));
            }
            check_status(response.status(), "job completion wait")?;
            let completion: JobCompletionResponse = response
                .json()
                .await
                .map_err(|err| VizierError::Request(err.to_string()))?;
            return Ok(completion.success);
        }
    }

    async fn delete_job(&self, name: &str) -> Result<(), VizierError> {
        let endpoint = self.endpoint(&format!("v1/jobs/{name}"))?;
        let response = self
            .http
            .delete(endpoint)
            .send()
            .await
            .map_err(|err| VizierError::Request(err.to_string()))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(VizierError::NotFound(format!("job {name}")));
        }
        check_status(response.status(), "job delete")
    }

    async fn create_secret(
        &self,
        name: &str,
        data: HashMap<String, String>,
    ) -> Result<(), VizierError> {
        let endpoint = self.endpoint(&format!("v1/secrets/{name}"))?;
        let response = self
            .http
            .put(endpoint)
            .json(&SecretRequest { data })
            .send()
            .await
            .map_err(|err| VizierError::Request(err.to_string()))?;
        check_status(response.status(), "secret create")
    }

    async fn cluster_uid(&self) -> Result<String, VizierError> {
        let endpoint = self.endpoint("v1/cluster/uid")?;
        let response: ClusterUidResponse = get_json(&self.http, endpoint).await?;
        Ok(response.cluster_uid)
    }

    async fn persist_cluster_id(&self, id: Uuid) -> Result<(), VizierError> {
        let endpoint = self.endpoint("v1/cluster/id")?;
        let response = self
            .http
            .put(endpoint)
            .json(&ClusterIdRequest { vizier_id: id })
            .send()
            .await
            .map_err(|err| VizierError::Persist(err.to_string()))?;
        if !response.status().is_success() {
            return Err(VizierError::Persist(format!(
                "unexpected http status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

async fn get_json<T: serde::de::DeserializeOwned>(
    http: &reqwest::Client,
    endpoint: Url,
) -> Result<T, VizierError> {
    let response = http
        .get(endpoint)
        .send()
        .await
        .map_err(|err| VizierError::Request(err.to_string()))?;
    check_status(response.status(), "orchestrator query")?;
    response
        .json()
        .await
        .map_err(|err| VizierError::Request(err.to_string()))
}

fn check_status(status: StatusCode, what: &str) -> Result<(), VizierError> {
    if status.is_success() {
        Ok(())
    } else {
        Err(VizierError::Request(format!(
            "{what} returned http status {status}"
        )))
    }
}

/// Expands `__KEY__` markers from the env substitution map and
/// `__VIZIER_<CONTAINER>_IMAGE_TAG__` markers from the image-tag map
/// (container names uppercased). An unresolved marker is a render error.
fn expand_template(
    template: &str,
    image_tags: &HashMap<String, String>,
    env_substitutions: &HashMap<String, String>,
) -> Result<String, VizierError> {
    let mut rendered = template.to_string();
    for (key, value) in env_substitutions {
        rendered = rendered.replace(&format!("__{key}__"), value);
    }
    for (container, tag) in image_tags {
        let marker = format!("__VIZIER_{}_IMAGE_TAG__", container.to_uppercase());
        rendered = rendered.replace(&marker, tag);
    }
    if let Some(start) = rendered.find("__") {
        let tail: String = rendered[start..].chars().take(40).collect();
        return Err(VizierError::Render(format!(
            "unresolved template marker near '{tail}'"
        )));
    }
    Ok(rendered)
}
