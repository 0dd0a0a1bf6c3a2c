//! Ray dashboard job API client
//!
//! The operator only needs three calls: look a submission up, submit one,
//! and stop one. A 404 on lookup means the cluster has never seen the id.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use kuberay_common::crd::JobStatus;
use kuberay_common::{Error, Result};

/// Request timeout for dashboard calls
pub const DEFAULT_DASHBOARD_TIMEOUT: Duration = Duration::from_secs(2);

const JOBS_PATH: &str = "/api/jobs/";

/// Job details as reported by `GET /api/jobs/{id}`
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct RayJobInfo {
    /// Remote status
    #[serde(default)]
    pub status: JobStatus,
    /// Entrypoint the job was submitted with
    #[serde(default)]
    pub entrypoint: String,
    /// Internal Ray job id
    #[serde(default)]
    pub job_id: Option<String>,
    /// Submission id the job was submitted under
    #[serde(default)]
    pub submission_id: Option<String>,
    /// Status detail
    #[serde(default)]
    pub message: Option<String>,
    /// Error classification for failed jobs
    #[serde(default)]
    pub error_type: Option<String>,
    /// Start time in milliseconds since the epoch
    #[serde(default)]
    pub start_time: Option<u64>,
    /// End time in milliseconds since the epoch
    #[serde(default)]
    pub end_time: Option<u64>,
}

/// Body of `POST /api/jobs/`
#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct SubmitJobRequest {
    /// Command to run
    pub entrypoint: String,
    /// Submission id; submitting an id twice is rejected by Ray
    pub submission_id: String,
    /// Runtime environment
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_env: Option<serde_json::Value>,
    /// Job metadata
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct SubmitJobResponse {
    #[serde(default)]
    submission_id: Option<String>,
    #[serde(default)]
    job_id: Option<String>,
}

/// Client for the Ray dashboard job API
///
/// `address` is the dashboard `host:port` recorded on the RayJob status.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DashboardClient: Send + Sync {
    /// Look a submission up; `None` when the dashboard doesn't know it
    async fn get_job_info(&self, address: &str, job_id: &str) -> Result<Option<RayJobInfo>>;

    /// Submit a job, returning its submission id
    async fn submit_job(&self, address: &str, request: &SubmitJobRequest) -> Result<String>;

    /// Ask the cluster to stop a job
    async fn stop_job(&self, address: &str, job_id: &str) -> Result<()>;
}

/// Dashboard client over HTTP
pub struct HttpDashboardClient {
    client: reqwest::Client,
}

impl HttpDashboardClient {
    /// Create a client whose requests give up after `timeout`
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                Error::internal_with_context("dashboard", format!("failed to build client: {e}"))
            })?;
        Ok(Self { client })
    }

    /// Create a client from an existing reqwest client
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

/// URL of the jobs API on `address`, with an optional trailing path
pub fn jobs_url(address: &str, path: &str) -> String {
    let base = if address.starts_with("http://") || address.starts_with("https://") {
        address.trim_end_matches('/').to_string()
    } else {
        format!("http://{}", address.trim_end_matches('/'))
    };
    format!("{base}{JOBS_PATH}{path}")
}

fn request_error(address: &str, e: reqwest::Error) -> Error {
    Error::dashboard(
        address,
        format!("request failed: {e}"),
        e.status().map(|s| s.as_u16()),
    )
}

async fn status_error(address: &str, response: reqwest::Response) -> Error {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Error::dashboard(address, format!("HTTP {status}: {body}"), Some(status.as_u16()))
}

#[async_trait]
impl DashboardClient for HttpDashboardClient {
    async fn get_job_info(&self, address: &str, job_id: &str) -> Result<Option<RayJobInfo>> {
        let url = jobs_url(address, job_id);
        debug!(%url, "fetching job info");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| request_error(address, e))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(status_error(address, response).await);
        }

        let info = response
            .json::<RayJobInfo>()
            .await
            .map_err(|e| Error::dashboard(address, format!("invalid job info: {e}"), None))?;
        Ok(Some(info))
    }

    async fn submit_job(&self, address: &str, request: &SubmitJobRequest) -> Result<String> {
        let url = jobs_url(address, "");
        debug!(%url, submission_id = %request.submission_id, "submitting job");

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| request_error(address, e))?;

        if !response.status().is_success() {
            return Err(status_error(address, response).await);
        }

        let body = response
            .json::<SubmitJobResponse>()
            .await
            .map_err(|e| Error::dashboard(address, format!("invalid submit response: {e}"), None))?;
        Ok(body
            .submission_id
            .or(body.job_id)
            .unwrap_or_else(|| request.submission_id.clone()))
    }

    async fn stop_job(&self, address: &str, job_id: &str) -> Result<()> {
        let url = jobs_url(address, &format!("{job_id}/stop"));
        debug!(%url, "stopping job");

        let response = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| request_error(address, e))?;

        // 404: nothing to stop
        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(status_error(address, response).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::bare_host("rc-head-svc.default.svc.cluster.local:8265", "abc", "http://rc-head-svc.default.svc.cluster.local:8265/api/jobs/abc")]
    #[case::with_scheme("http://127.0.0.1:8265/", "", "http://127.0.0.1:8265/api/jobs/")]
    #[case::https("https://dash:443", "abc/stop", "https://dash:443/api/jobs/abc/stop")]
    fn builds_jobs_urls(#[case] address: &str, #[case] path: &str, #[case] expected: &str) {
        assert_eq!(jobs_url(address, path), expected);
    }

    #[test]
    fn job_info_parses_dashboard_payload() {
        let payload = r#"{
            "type": "SUBMISSION",
            "job_id": "02000000",
            "submission_id": "rayjob-sample",
            "status": "RUNNING",
            "entrypoint": "python script.py",
            "message": "Job is currently running.",
            "error_type": null,
            "start_time": 1700000000000,
            "end_time": null,
            "metadata": {},
            "runtime_env": {}
        }"#;
        let info: RayJobInfo = serde_json::from_str(payload).unwrap();
        assert_eq!(info.status, JobStatus::Running);
        assert_eq!(info.submission_id.as_deref(), Some("rayjob-sample"));
        assert_eq!(info.start_time, Some(1_700_000_000_000));
    }

    #[test]
    fn submit_request_omits_empty_fields() {
        let request = SubmitJobRequest {
            entrypoint: "python script.py".to_string(),
            submission_id: "rayjob-sample".to_string(),
            ..Default::default()
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["submission_id"], "rayjob-sample");
        assert!(json.get("runtime_env").is_none());
        assert!(json.get("metadata").is_none());
    }
}
