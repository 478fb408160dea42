//! # GCP
//!
//! Minimal REST clients for the Google Cloud services the bridge talks to.
use std::time;

use reqwest::{header, Client, Response, StatusCode};
use thiserror::Error;

pub mod auth;
pub mod bigquery;
pub mod datastore;

pub use auth::{MetadataServerToken, StaticToken, TokenProvider};
pub use bigquery::BigQueryClient;
pub use datastore::DatastoreCatalog;

pub const DEFAULT_BIGQUERY_ENDPOINT: &str = "https://bigquery.googleapis.com";
pub const DEFAULT_DATASTORE_ENDPOINT: &str = "https://datastore.googleapis.com";
pub const DEFAULT_METADATA_ENDPOINT: &str = "http://metadata.google.internal";

/// Enumeration of errors returned by the Google Cloud clients.
#[derive(Error, Debug)]
pub enum GcpError {
    #[error("failed to obtain an access token: {0}")]
    Auth(String),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("{service} responded with {status}: {body}")]
    Status {
        service: &'static str,
        status: StatusCode,
        body: String,
    },
}

pub fn build_http_client(request_timeout: time::Duration) -> reqwest::Result<Client> {
    let mut headers = header::HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    reqwest::Client::builder()
        .default_headers(headers)
        .user_agent("Datastore Export Bridge")
        .timeout(request_timeout)
        .build()
}

/// Turn a non-success response into `GcpError::Status`, keeping the body for the logs.
async fn check_status(service: &'static str, response: Response) -> Result<Response, GcpError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(GcpError::Status {
        service,
        status,
        body,
    })
}
