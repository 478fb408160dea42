use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{check_status, GcpError, TokenProvider};
use crate::kinds::{CatalogError, KindCatalog};

const KIND_METADATA_KIND: &str = "__kind__";
const KEY_PROPERTY: &str = "__key__";
const NO_MORE_RESULTS: &str = "NO_MORE_RESULTS";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RunQueryRequest<'a> {
    query: Query<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Query<'a> {
    kind: [Name<'a>; 1],
    projection: [Projection<'a>; 1],
    #[serde(skip_serializing_if = "Option::is_none")]
    start_cursor: Option<&'a str>,
}

#[derive(Serialize)]
struct Name<'a> {
    name: &'a str,
}

#[derive(Serialize)]
struct Projection<'a> {
    property: Name<'a>,
}

#[derive(Deserialize)]
struct RunQueryResponse {
    batch: QueryResultBatch,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResultBatch {
    #[serde(default)]
    entity_results: Vec<EntityResult>,
    #[serde(default)]
    end_cursor: Option<String>,
    #[serde(default)]
    more_results: String,
}

#[derive(Deserialize)]
struct EntityResult {
    entity: Entity,
}

#[derive(Deserialize)]
struct Entity {
    key: Key,
}

#[derive(Deserialize)]
struct Key {
    #[serde(default)]
    path: Vec<PathElement>,
}

#[derive(Deserialize)]
struct PathElement {
    #[serde(default)]
    name: Option<String>,
}

/// Lists kinds by querying the `__kind__` metadata kind through the Datastore REST API.
pub struct DatastoreCatalog {
    client: Client,
    endpoint: String,
    project_id: String,
    tokens: Arc<dyn TokenProvider + Send + Sync>,
}

impl DatastoreCatalog {
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

    async fn run_query(&self, start_cursor: Option<&str>) -> Result<QueryResultBatch, GcpError> {
        let token = self.tokens.access_token().await?;
        let url = format!(
            "{}/v1/projects/{}:runQuery",
            self.endpoint, self.project_id
        );

        let request = RunQueryRequest {
            query: Query {
                kind: [Name {
                    name: KIND_METADATA_KIND,
                }],
                projection: [Projection {
                    property: Name { name: KEY_PROPERTY },
                }],
                start_cursor,
            },
        };

        let response = self
            .client
            .post(url)
            .bearer_auth(token)
            .json(&request)
            .send()
            .await?;

        let response = check_status("datastore", response).await?;
        Ok(response.json::<RunQueryResponse>().await?.batch)
    }
}

#[async_trait]
impl KindCatalog for DatastoreCatalog {
    async fn list_kinds(&self) -> Result<Vec<String>, CatalogError> {
        let mut kinds = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let batch = self.run_query(cursor.as_deref()).await?;

            kinds.extend(batch.entity_results.into_iter().filter_map(|result| {
                result
                    .entity
                    .key
                    .path
                    .into_iter()
                    .last()
                    .and_then(|element| element.name)
            }));

            if batch.more_results == NO_MORE_RESULTS
                || batch.end_cursor.is_none()
                || batch.end_cursor == cursor
            {
                break;
            }

            cursor = batch.end_cursor;
        }

        Ok(kinds)
    }
}
