//! Glacier-style REST archival client.
//!
//! Requests are sent unsigned; deployments put a signing proxy in front of
//! the endpoint when the service requires request signatures.

use crate::client::{ArchiveClient, ArchiveStream, JobStatus, RetrievalRequest};
use crate::error::{ArchiveError, ArchiveResult};
use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Header carrying the id of a newly created job
const JOB_ID_HEADER: &str = "x-amz-job-id";

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct InitiateJobBody<'a> {
    #[serde(rename = "Type")]
    job_type: &'static str,
    archive_id: &'a str,
    #[serde(rename = "SNSTopic", skip_serializing_if = "str::is_empty")]
    sns_topic: &'a str,
    tier: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_location: Option<OutputLocation<'a>>,
}

#[derive(Debug, Serialize)]
struct OutputLocation<'a> {
    #[serde(rename = "S3")]
    s3: S3Location<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct S3Location<'a> {
    bucket_name: &'a str,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InitiateJobResponse {
    #[serde(default)]
    job_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: String,
    #[serde(default)]
    message: String,
}

/// Map a failed response to an [`ArchiveError`].
///
/// The JSON error body decides when present; otherwise the HTTP status.
fn error_from_response(status: StatusCode, body: &str) -> ArchiveError {
    if let Ok(err) = serde_json::from_str::<ErrorBody>(body) {
        return ArchiveError::from_code(&err.code, err.message);
    }
    let message = format!("HTTP {status}: {body}");
    match status {
        StatusCode::NOT_FOUND => ArchiveError::NotFound(message),
        StatusCode::BAD_REQUEST => ArchiveError::InvalidParameter(message),
        StatusCode::TOO_MANY_REQUESTS => ArchiveError::LimitExceeded(message),
        StatusCode::SERVICE_UNAVAILABLE | StatusCode::BAD_GATEWAY | StatusCode::GATEWAY_TIMEOUT => {
            ArchiveError::ServiceUnavailable(message)
        }
        _ => {
            warn!(%status, "unmapped archive service response");
            ArchiveError::Internal(message)
        }
    }
}

/// [`ArchiveClient`] over HTTP
pub struct HttpArchiveClient {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpArchiveClient {
    /// Create a client for `endpoint` (e.g. `https://glacier.example.com`)
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> ArchiveResult<Self> {
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        if endpoint.is_empty() {
            return Err(ArchiveError::MissingParameter(
                "archive endpoint is required".into(),
            ));
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ArchiveError::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http, endpoint })
    }

    fn jobs_url(&self, account_id: &str, vault_name: &str) -> String {
        format!("{}/{account_id}/vaults/{vault_name}/jobs", self.endpoint)
    }

    fn job_url(&self, account_id: &str, vault_name: &str, job_id: &str) -> String {
        format!("{}/{job_id}", self.jobs_url(account_id, vault_name))
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> ArchiveResult<reqwest::Response> {
        let response = req.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(error_from_response(status, &body))
    }
}

#[async_trait]
impl ArchiveClient for HttpArchiveClient {
    async fn initiate_retrieval(&self, request: &RetrievalRequest) -> ArchiveResult<String> {
        request.validate()?;
        let body = InitiateJobBody {
            job_type: "archive-retrieval",
            archive_id: &request.archive_id,
            sns_topic: &request.notification_topic,
            tier: request.tier.as_str(),
            output_location: (!request.output_bucket.is_empty()).then(|| OutputLocation {
                s3: S3Location {
                    bucket_name: &request.output_bucket,
                },
            }),
        };
        let url = self.jobs_url(&request.account_id, &request.vault_name);
        let response = self.send(self.http.post(&url).json(&body)).await?;

        let header_id = response
            .headers()
            .get(JOB_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let job_id = match header_id {
            Some(id) => id,
            None => {
                let text = response.text().await?;
                serde_json::from_str::<InitiateJobResponse>(&text)
                    .unwrap_or_default()
                    .job_id
                    .ok_or_else(|| {
                        ArchiveError::Internal("retrieval response carries no job id".into())
                    })?
            }
        };
        debug!(
            archive_id = %request.archive_id,
            vault = %request.vault_name,
            job_id = %job_id,
            "initiated archive retrieval"
        );
        Ok(job_id)
    }

    async fn job_status(
        &self,
        account_id: &str,
        vault_name: &str,
        job_id: &str,
    ) -> ArchiveResult<JobStatus> {
        let url = self.job_url(account_id, vault_name, job_id);
        let response = self.send(self.http.get(&url)).await?;
        let text = response.text().await?;
        serde_json::from_str(&text)
            .map_err(|e| ArchiveError::Internal(format!("malformed job status: {e}")))
    }

    async fn job_output(
        &self,
        account_id: &str,
        vault_name: &str,
        job_id: &str,
    ) -> ArchiveResult<ArchiveStream> {
        let url = format!("{}/output", self.job_url(account_id, vault_name, job_id));
        let response = self.send(self.http.get(&url)).await?;
        Ok(Box::pin(response.bytes_stream().map_err(ArchiveError::from)))
    }
}
