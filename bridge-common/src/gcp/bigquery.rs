use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{check_status, GcpError, TokenProvider};
use crate::import::{ImportEngine, ImportError, JobReference, LoadJob};

#[derive(Serialize)]
struct InsertJobRequest<'a> {
    configuration: JobConfiguration<'a>,
}

#[derive(Serialize)]
struct JobConfiguration<'a> {
    load: &'a LoadJob,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct InsertJobResponse {
    #[serde(default)]
    job_reference: JobReference,
    #[serde(default)]
    status: Option<JobStatus>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatus {
    #[serde(default)]
    error_result: Option<ErrorProto>,
}

#[derive(Deserialize)]
struct ErrorProto {
    #[serde(default)]
    reason: String,
    #[serde(default)]
    message: String,
}

/// Submits load jobs through the BigQuery `jobs.insert` REST method.
pub struct BigQueryClient {
    client: Client,
    endpoint: String,
    project_id: String,
    tokens: Arc<dyn TokenProvider + Send + Sync>,
}

impl BigQueryClient {
    pub fn new(
        client: Client,
        endpoint: &str,
        project_id: &str,
        tokens: Arc<dyn TokenProvider + Send + Sync>,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_owned(),
            project_id: project_id.to_owned(),
            tokens,
        }
    }
}

#[async_trait]
impl ImportEngine for BigQueryClient {
    async fn submit_load_job(&self, job: LoadJob) -> Result<JobReference, ImportError> {
        let token = self.tokens.access_token().await?;
        let url = format!(
            "{}/bigquery/v2/projects/{}/jobs",
            self.endpoint, self.project_id
        );

        let response = self
            .client
            .post(url)
            .bearer_auth(token)
            .json(&InsertJobRequest {
                configuration: JobConfiguration { load: &job },
            })
            .send()
            .await
            .map_err(GcpError::from)?;

        let response = check_status("bigquery", response).await?;
        let inserted: InsertJobResponse = response.json().await.map_err(GcpError::from)?;

        if let Some(error) = inserted.status.and_then(|s| s.error_result) {
            return Err(ImportError::Rejected(format!(
                "{}: {}",
                error.reason, error.message
            )));
        }

        Ok(inserted.job_reference)
    }
}
