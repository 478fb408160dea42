//! # Import
//!
//! Bulk load jobs submitted to the analytics store.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gcp::GcpError;

#[derive(Error, Debug)]
pub enum ImportError {
    #[error(transparent)]
    Gcp(#[from] GcpError),
    #[error("load job was rejected: {0}")]
    Rejected(String),
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceFormat {
    DatastoreBackup,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WriteDisposition {
    /// Replace all data in the destination table.
    WriteTruncate,
    WriteAppend,
    WriteEmpty,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TableReference {
    pub project_id: String,
    pub dataset_id: String,
    pub table_id: String,
}

impl TableReference {
    pub fn new(project_id: &str, dataset_id: &str, table_id: &str) -> Self {
        Self {
            project_id: project_id.to_owned(),
            dataset_id: dataset_id.to_owned(),
            table_id: table_id.to_owned(),
        }
    }
}

/// A request to load `source_uris` into `destination`.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LoadJob {
    pub source_uris: Vec<String>,
    pub destination_table: TableReference,
    pub source_format: SourceFormat,
    pub write_disposition: WriteDisposition,
}

impl LoadJob {
    /// A load of a Datastore export that fully replaces the destination table, so loading the
    /// same export twice leaves the table as if it were loaded once.
    pub fn datastore_backup(source_uri: String, destination: TableReference) -> Self {
        Self {
            source_uris: vec![source_uri],
            destination_table: destination,
            source_format: SourceFormat::DatastoreBackup,
            write_disposition: WriteDisposition::WriteTruncate,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct JobReference {
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

#[async_trait]
pub trait ImportEngine {
    async fn submit_load_job(&self, job: LoadJob) -> Result<JobReference, ImportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datastore_backup_job_overwrites() {
        let job = LoadJob::datastore_backup(
            "gs://backup/handle.Order.backup_info".to_owned(),
            TableReference::new("project", "ds", "Order"),
        );

        let encoded = serde_json::to_value(&job).unwrap();

        assert_eq!(
            encoded,
            serde_json::json!({
                "sourceUris": ["gs://backup/handle.Order.backup_info"],
                "destinationTable": {
                    "projectId": "project",
                    "datasetId": "ds",
                    "tableId": "Order",
                },
                "sourceFormat": "DATASTORE_BACKUP",
                "writeDisposition": "WRITE_TRUNCATE",
            })
        );
    }
}
