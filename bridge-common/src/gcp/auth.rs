use std::time;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::Mutex;

use super::GcpError;

/// Tokens are refreshed this long before they expire.
const EXPIRY_MARGIN: time::Duration = time::Duration::from_secs(60);

#[async_trait]
pub trait TokenProvider {
    async fn access_token(&self) -> Result<String, GcpError>;
}

/// A fixed token, for local development and emulators.
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: &str) -> Self {
        Self(token.to_owned())
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn access_token(&self) -> Result<String, GcpError> {
        Ok(self.0.clone())
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    token: String,
    expires_at: time::Instant,
}

/// Fetches the default service account token from the instance metadata server.
pub struct MetadataServerToken {
    client: Client,
    endpoint: String,
    cached: Mutex<Option<CachedToken>>,
}

impl MetadataServerToken {
    pub fn new(client: Client, endpoint: &str) -> Self {
        Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_owned(),
            cached: Mutex::new(None),
        }
    }

    async fn fetch(&self) -> Result<TokenResponse, GcpError> {
        let url = format!(
            "{}/computeMetadata/v1/instance/service-accounts/default/token",
            self.endpoint
        );

        let response = self
            .client
            .get(url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| GcpError::Auth(e.to_string()))?;

        if !response.status().is_success() {
            return Err(GcpError::Auth(format!(
                "metadata server responded with {}",
                response.status()
            )));
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| GcpError::Auth(e.to_string()))
    }
}

#[async_trait]
impl TokenProvider for MetadataServerToken {
    async fn access_token(&self) -> Result<String, GcpError> {
        let mut cached = self.cached.lock().await;

        if let Some(token) = cached.as_ref() {
            if time::Instant::now() < token.expires_at {
                return Ok(token.token.clone());
            }
        }

        let fetched = self.fetch().await?;
        let lifetime = time::Duration::from_secs(fetched.expires_in).saturating_sub(EXPIRY_MARGIN);

        *cached = Some(CachedToken {
            token: fetched.access_token.clone(),
            expires_at: time::Instant::now() + lifetime,
        });

        Ok(fetched.access_token)
    }
}
