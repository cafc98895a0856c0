//! Instance metadata substrate client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderValue;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::secret::SecretValue;

/// Overrides the metadata server host, mainly for tests and emulators.
pub const METADATA_HOST_ENV: &str = "GCE_METADATA_HOST";

const DEFAULT_METADATA_HOST: &str = "169.254.169.254";
const METADATA_FLAVOR: &str = "Metadata-Flavor";
const FLAVOR_GOOGLE: &str = "Google";
const PROJECT_ID_PATH: &str = "/computeMetadata/v1/project/project-id";
const TOKEN_PATH: &str = "/computeMetadata/v1/instance/service-accounts/default/token";

const PROBE_TIMEOUT: Duration = Duration::from_secs(1);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Metadata lookup errors.
#[derive(Debug, Error)]
pub enum MetadataError {
    /// The HTTP request failed outright.
    #[error("metadata request to {path} failed")]
    Request {
        /// Metadata path requested.
        path: &'static str,
        /// Underlying client error.
        #[source]
        source: reqwest::Error,
    },

    /// The server answered with a non-success status.
    #[error("metadata request to {path} returned HTTP {status}")]
    Status {
        /// Metadata path requested.
        path: &'static str,
        /// Status code returned.
        status: u16,
    },

    /// The server answered with an empty value.
    #[error("metadata value at {path} is empty")]
    Empty {
        /// Metadata path requested.
        path: &'static str,
    },
}

/// The runtime substrate's metadata service.
#[async_trait]
pub trait MetadataClient: Send + Sync {
    /// True when the process runs on the managed substrate.
    async fn on_substrate(&self) -> bool;

    /// Project id of the running instance.
    async fn project_id(&self) -> Result<String, MetadataError>;

    /// OAuth access token of the instance's default service account.
    async fn access_token(&self) -> Result<SecretValue, MetadataError>;
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Metadata client talking to the GCE metadata server over HTTP.
#[derive(Debug)]
pub struct GceMetadataClient {
    http: reqwest::Client,
    base_url: String,
    on_substrate: OnceCell<bool>,
}

impl GceMetadataClient {
    /// Client for the host named by `GCE_METADATA_HOST`, or the link-local default.
    #[must_use]
    pub fn from_env() -> Self {
        let host = std::env::var(METADATA_HOST_ENV)
            .ok()
            .filter(|h| !h.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_METADATA_HOST.to_string());
        Self::with_host(&host)
    }

    /// Client for an explicit `host[:port]`.
    #[must_use]
    pub fn with_host(host: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: format!("http://{host}"),
            on_substrate: OnceCell::new(),
        }
    }

    async fn get(&self, path: &'static str) -> Result<reqwest::Response, MetadataError> {
        let response = self
            .http
            .get(format!("{}{path}", self.base_url))
            .header(METADATA_FLAVOR, FLAVOR_GOOGLE)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|source| MetadataError::Request { path, source })?;

        if !response.status().is_success() {
            return Err(MetadataError::Status {
                path,
                status: response.status().as_u16(),
            });
        }
        Ok(response)
    }

    async fn probe(&self) -> bool {
        let result = self
            .http
            .get(format!("{}/", self.base_url))
            .header(METADATA_FLAVOR, FLAVOR_GOOGLE)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await;

        match result {
            Ok(response) => {
                response.headers().get(METADATA_FLAVOR)
                    == Some(&HeaderValue::from_static(FLAVOR_GOOGLE))
            }
            Err(e) => {
                tracing::debug!(error = %e, "Metadata server not reachable");
                false
            }
        }
    }
}

#[async_trait]
impl MetadataClient for GceMetadataClient {
    async fn on_substrate(&self) -> bool {
        *self.on_substrate.get_or_init(|| self.probe()).await
    }

    async fn project_id(&self) -> Result<String, MetadataError> {
        let response = self.get(PROJECT_ID_PATH).await?;
        let body = response
            .text()
            .await
            .map_err(|source| MetadataError::Request {
                path: PROJECT_ID_PATH,
                source,
            })?;
        let project_id = body.trim();
        if project_id.is_empty() {
            return Err(MetadataError::Empty {
                path: PROJECT_ID_PATH,
            });
        }
        Ok(project_id.to_string())
    }

    async fn access_token(&self) -> Result<SecretValue, MetadataError> {
        let response = self.get(TOKEN_PATH).await?;
        let token: TokenResponse =
            response
                .json()
                .await
                .map_err(|source| MetadataError::Request {
                    path: TOKEN_PATH,
                    source,
                })?;
        if token.access_token.is_empty() {
            return Err(MetadataError::Empty { path: TOKEN_PATH });
        }
        Ok(SecretValue::new(token.access_token))
    }
}
