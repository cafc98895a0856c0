//! Auxiliary clients handed to the gomote service.
//!
//! Both clients are built once during bootstrap, each under its own deadline.
//! A timeout or construction error is fatal to startup. There are no retries.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gomote_core::environment::{DeploymentContext, MetadataClient, MetadataError};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use thiserror::Error;

/// Object storage API endpoint.
pub const STORAGE_ENDPOINT: &str = "https://storage.googleapis.com";

/// Remote configuration service endpoint.
pub const CONFIG_ENDPOINT: &str = "https://config.luci.app";

/// Client construction failures.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Construction did not finish within its bound.
    #[error("timed out after {timeout:?} creating {client} client")]
    Timeout {
        /// Which client.
        client: &'static str,
        /// The bound that was exceeded.
        timeout: Duration,
    },

    /// No service-account credentials were available.
    #[error("failed to obtain credentials for {client} client")]
    Credentials {
        /// Which client.
        client: &'static str,
        /// Metadata lookup error.
        #[source]
        source: MetadataError,
    },

    /// The access token cannot be sent as a header.
    #[error("access token for {client} client is not a valid header value")]
    InvalidToken {
        /// Which client.
        client: &'static str,
    },

    /// The HTTP client could not be built.
    #[error("failed to build {client} client")]
    Build {
        /// Which client.
        client: &'static str,
        /// Underlying builder error.
        #[source]
        source: reqwest::Error,
    },
}

/// Object storage client for the gomote transfer bucket.
#[derive(Debug, Clone)]
pub struct StorageClient {
    // Handle for the gomote method bodies.
    #[allow(dead_code)]
    http: reqwest::Client,
    endpoint: String,
    bucket: String,
    authenticated: bool,
}

impl StorageClient {
    /// Bucket the client reads and writes.
    #[must_use]
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Whether requests carry service-account credentials.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Service endpoint.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Remote configuration client, used to list available builders.
#[derive(Debug, Clone)]
pub struct ConfigClient {
    // Handle for the gomote method bodies.
    #[allow(dead_code)]
    http: reqwest::Client,
    endpoint: String,
}

impl ConfigClient {
    /// Service endpoint.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Builds the auxiliary clients.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    /// Object storage client for `bucket`.
    async fn storage(&self, bucket: &str) -> Result<StorageClient, ClientError>;

    /// Remote configuration client.
    async fn config(&self) -> Result<ConfigClient, ClientError>;
}

/// Factory producing real HTTP clients.
///
/// Clients authenticate with the instance's service account whenever the
/// process runs on the metadata substrate, including forced-prod runs there.
/// Local development is always anonymous.
pub struct HttpClientFactory {
    metadata: Arc<dyn MetadataClient>,
    context: DeploymentContext,
}

impl HttpClientFactory {
    /// Factory for the given deployment.
    #[must_use]
    pub fn new(metadata: Arc<dyn MetadataClient>, context: DeploymentContext) -> Self {
        Self { metadata, context }
    }

    async fn wants_credentials(&self) -> bool {
        match self.context {
            DeploymentContext::LocalDev => false,
            DeploymentContext::Managed => true,
            DeploymentContext::ForcedProd => self.metadata.on_substrate().await,
        }
    }

    async fn build(&self, client: &'static str) -> Result<(reqwest::Client, bool), ClientError> {
        let mut headers = HeaderMap::new();
        let authenticated = self.wants_credentials().await;
        if authenticated {
            let token = self
                .metadata
                .access_token()
                .await
                .map_err(|source| ClientError::Credentials { client, source })?;
            let mut value = HeaderValue::from_str(&format!("Bearer {}", token.expose()))
                .map_err(|_| ClientError::InvalidToken { client })?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(concat!("gomoteserver/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|source| ClientError::Build { client, source })?;
        Ok((http, authenticated))
    }
}

#[async_trait]
impl ClientFactory for HttpClientFactory {
    async fn storage(&self, bucket: &str) -> Result<StorageClient, ClientError> {
        let (http, authenticated) = self.build("storage").await?;
        Ok(StorageClient {
            http,
            endpoint: STORAGE_ENDPOINT.to_string(),
            bucket: bucket.to_string(),
            authenticated,
        })
    }

    async fn config(&self) -> Result<ConfigClient, ClientError> {
        let (http, _) = self.build("config").await?;
        Ok(ConfigClient {
            http,
            endpoint: CONFIG_ENDPOINT.to_string(),
        })
    }
}

async fn bounded<T>(
    client: &'static str,
    timeout: Duration,
    build: impl Future<Output = Result<T, ClientError>>,
) -> Result<T, ClientError> {
    tokio::time::timeout(timeout, build)
        .await
        .map_err(|_| ClientError::Timeout { client, timeout })?
}

/// Build both clients, each under its own bound.
pub async fn build_clients(
    factory: &dyn ClientFactory,
    bucket: &str,
    storage_timeout: Duration,
    config_timeout: Duration,
) -> Result<(StorageClient, ConfigClient), ClientError> {
    let storage = bounded("storage", storage_timeout, factory.storage(bucket)).await?;
    tracing::info!(
        bucket = %storage.bucket(),
        endpoint = %storage.endpoint(),
        authenticated = storage.is_authenticated(),
        "Storage client ready"
    );
    let config = bounded("config", config_timeout, factory.config()).await?;
    tracing::info!(endpoint = %config.endpoint(), "Config client ready");
    Ok((storage, config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gomote_core::secret::SecretValue;

    struct NoMetadata;

    #[async_trait]
    impl MetadataClient for NoMetadata {
        async fn on_substrate(&self) -> bool {
            false
        }
        async fn project_id(&self) -> Result<String, MetadataError> {
            Err(MetadataError::Empty { path: "project-id" })
        }
        async fn access_token(&self) -> Result<SecretValue, MetadataError> {
            Err(MetadataError::Empty { path: "token" })
        }
    }

    /// On the substrate, handing out a fixed token.
    struct OnSubstrate(&'static str);

    #[async_trait]
    impl MetadataClient for OnSubstrate {
        async fn on_substrate(&self) -> bool {
            true
        }
        async fn project_id(&self) -> Result<String, MetadataError> {
            Ok("example-prod".to_string())
        }
        async fn access_token(&self) -> Result<SecretValue, MetadataError> {
            Ok(SecretValue::new(self.0))
        }
    }

    struct SlowConfig(HttpClientFactory);

    #[async_trait]
    impl ClientFactory for SlowConfig {
        async fn storage(&self, bucket: &str) -> Result<StorageClient, ClientError> {
            self.0.storage(bucket).await
        }
        async fn config(&self) -> Result<ConfigClient, ClientError> {
            std::future::pending().await
        }
    }

    fn local_factory() -> HttpClientFactory {
        HttpClientFactory::new(Arc::new(NoMetadata), DeploymentContext::LocalDev)
    }

    #[tokio::test]
    async fn test_local_clients_are_anonymous() {
        let (storage, config) = build_clients(
            &local_factory(),
            "gomote-transfer",
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert!(!storage.is_authenticated());
        assert_eq!(storage.bucket(), "gomote-transfer");
        assert_eq!(storage.endpoint(), STORAGE_ENDPOINT);
        assert_eq!(config.endpoint(), CONFIG_ENDPOINT);
    }

    #[tokio::test]
    async fn test_managed_without_credentials_fails() {
        let factory = HttpClientFactory::new(Arc::new(NoMetadata), DeploymentContext::Managed);
        let err = factory.storage("bucket").await.unwrap_err();
        assert!(matches!(err, ClientError::Credentials { client: "storage", .. }));
    }

    #[tokio::test]
    async fn test_construction_deadline_is_fatal() {
        let factory = SlowConfig(local_factory());
        let err = build_clients(
            &factory,
            "",
            Duration::from_secs(5),
            Duration::from_millis(20),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ClientError::Timeout { client: "config", .. }));
    }

    #[tokio::test]
    async fn test_forced_prod_on_substrate_authenticates() {
        let factory = HttpClientFactory::new(
            Arc::new(OnSubstrate("token")),
            DeploymentContext::ForcedProd,
        );
        assert!(factory.storage("bucket").await.unwrap().is_authenticated());

        let off = HttpClientFactory::new(Arc::new(NoMetadata), DeploymentContext::ForcedProd);
        assert!(!off.storage("bucket").await.unwrap().is_authenticated());
    }

    #[tokio::test]
    async fn test_local_dev_ignores_substrate() {
        let factory =
            HttpClientFactory::new(Arc::new(OnSubstrate("token")), DeploymentContext::LocalDev);
        assert!(!factory.storage("bucket").await.unwrap().is_authenticated());
    }

    #[tokio::test]
    async fn test_unsendable_token_is_rejected() {
        let factory = HttpClientFactory::new(
            Arc::new(OnSubstrate("bad\ntoken")),
            DeploymentContext::Managed,
        );
        let err = factory.config().await.unwrap_err();
        assert!(matches!(err, ClientError::InvalidToken { client: "config" }));
    }
}
