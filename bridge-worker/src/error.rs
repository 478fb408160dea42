use std::time;

use bridge_common::pgqueue;
use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;

/// Errors that can occur as `DeliveryWorker` sends a task to its target.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("error building url for target {target}: {error}")]
    InvalidTarget {
        target: String,
        error: url::ParseError,
    },
    #[error("retryable delivery failure: {error}")]
    Retryable {
        error: reqwest::Error,
        status: Option<StatusCode>,
        retry_after: Option<time::Duration>,
    },
    #[error("delivery failure: {error}")]
    NonRetryable {
        error: reqwest::Error,
        status: Option<StatusCode>,
    },
}

impl DeliveryError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            DeliveryError::InvalidTarget { .. } => None,
            DeliveryError::Retryable { status, .. }
            | DeliveryError::NonRetryable { status, .. } => *status,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, DeliveryError::Retryable { .. })
    }
}

/// What gets appended to a task's `errors` column after a failed attempt.
#[derive(Serialize, Debug, PartialEq, Eq)]
pub struct TaskError {
    pub r#type: TaskErrorType,
    pub details: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

#[derive(Serialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorType {
    InvalidTarget,
    Timeout,
    HttpStatus,
    Connection,
}

impl From<&DeliveryError> for TaskError {
    fn from(error: &DeliveryError) -> Self {
        let r#type = match error {
            DeliveryError::InvalidTarget { .. } => TaskErrorType::InvalidTarget,
            DeliveryError::Retryable { error, .. }
            | DeliveryError::NonRetryable { error, .. } => {
                if error.is_timeout() {
                    TaskErrorType::Timeout
                } else if error.is_status() {
                    TaskErrorType::HttpStatus
                } else {
                    TaskErrorType::Connection
                }
            }
        };

        TaskError {
            r#type,
            details: error.to_string(),
            status: error.status().map(|status| status.as_u16()),
        }
    }
}

/// Errors that stop `DeliveryWorker` from processing tasks at all.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    DatabaseError(#[from] pgqueue::DatabaseError),
    #[error("invalid target base url: {0}")]
    InvalidBaseUrl(#[from] url::ParseError),
    #[error("failed to construct http client: {0}")]
    HttpClient(#[from] reqwest::Error),
}
