//! Deployment context resolution.
//!
//! The server decides once, at startup, what kind of deployment it is running
//! in. That single decision drives two policies downstream: whether RPC calls
//! must carry an identity-aware-proxy assertion, and whether the shell
//! subsystem may fall back to throwaway host keys.
//!
//! # Classification
//!
//! | explicit env | mode      | on substrate | context      |
//! |--------------|-----------|--------------|--------------|
//! | any          | `dev`     | any          | `LocalDev`   |
//! | set          | not `dev` | any          | `ForcedProd` |
//! | unset        | not `dev` | no           | `ForcedProd` |
//! | unset        | not `dev` | yes          | `Managed`    |
//!
//! Only the last row produces an environment configuration, which is derived
//! from the project id the substrate reports and the environment catalog.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::config::{CatalogError, Mode, find_catalog_file, load_catalog};

pub mod metadata;

pub use metadata::{GceMetadataClient, MetadataClient, MetadataError};

/// Load-balancer backend whose IAP service id guards the RPC surface.
pub const IAP_BACKEND: &str = "coordinator-internal-iap";

/// Resolved deployment context. Immutable for the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentContext {
    /// Running on the managed substrate with auto-detected configuration.
    Managed,
    /// Local development (`--mode=dev`).
    LocalDev,
    /// Production-like behaviour without substrate-derived configuration.
    ForcedProd,
}

impl DeploymentContext {
    /// Classify the deployment. Pure; the caller supplies the substrate probe result.
    #[must_use]
    pub fn classify(env_name: Option<&str>, mode: Mode, on_substrate: bool) -> Self {
        let explicit_env = env_name.is_some_and(|name| !name.trim().is_empty());
        match (mode, explicit_env, on_substrate) {
            (Mode::Dev, _, _) => Self::LocalDev,
            (_, true, _) | (_, false, false) => Self::ForcedProd,
            (_, false, true) => Self::Managed,
        }
    }

    /// True for [`DeploymentContext::Managed`].
    #[must_use]
    pub fn is_managed(self) -> bool {
        matches!(self, Self::Managed)
    }

    /// Whether the shell subsystem may generate ephemeral host keys.
    #[must_use]
    pub fn allows_ephemeral_keys(self) -> bool {
        matches!(self, Self::LocalDev)
    }
}

impl fmt::Display for DeploymentContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Managed => write!(f, "managed"),
            Self::LocalDev => write!(f, "local-dev"),
            Self::ForcedProd => write!(f, "forced-prod"),
        }
    }
}

/// IAP backend service id. Never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendServiceId(String);

impl BackendServiceId {
    /// Wrap a service id, rejecting blank values.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Option<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            None
        } else {
            Some(Self(id))
        }
    }

    /// The id as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BackendServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Environment-specific configuration. Default (empty) outside `Managed`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvConfig {
    /// Environment name from the catalog.
    pub name: String,
    /// Cloud project id.
    pub project_id: String,
    /// Bucket used for gomote file transfers.
    pub gomote_bucket: String,
    /// IAP backend service id for [`IAP_BACKEND`].
    pub backend_service_id: Option<BackendServiceId>,
}

/// Outcome of environment resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Deployment context.
    pub context: DeploymentContext,
    /// Environment configuration.
    pub env: EnvConfig,
}

/// Fatal environment resolution failures.
#[derive(Debug, Error)]
pub enum EnvironmentError {
    /// The substrate would not report a project id.
    #[error("failed to resolve project id from instance metadata")]
    ProjectId(#[source] MetadataError),

    /// The environment catalog could not be loaded.
    #[error("failed to load environment catalog")]
    Catalog(#[from] CatalogError),

    /// The project id has no catalog entry.
    #[error("project '{project_id}' is not a known build environment")]
    UnknownProject {
        /// Project id reported by the substrate.
        project_id: String,
    },

    /// The catalog entry has no IAP service id for the backend.
    #[error("environment '{env}' has no IAP service id for backend '{backend}'")]
    MissingBackendServiceId {
        /// Environment name.
        env: String,
        /// Backend service name.
        backend: &'static str,
    },
}

/// Resolves the deployment context and environment configuration.
pub struct EnvironmentResolver {
    metadata: Arc<dyn MetadataClient>,
    catalog_path: Option<PathBuf>,
}

impl EnvironmentResolver {
    /// Resolver backed by `metadata`, reading the catalog from `catalog_path`
    /// or the default search locations.
    #[must_use]
    pub fn new(metadata: Arc<dyn MetadataClient>, catalog_path: Option<PathBuf>) -> Self {
        Self {
            metadata,
            catalog_path,
        }
    }

    /// Resolve the deployment.
    ///
    /// The metadata substrate is never contacted when `mode` is `Dev` or an
    /// explicit environment name is given.
    pub async fn resolve(
        &self,
        env_name: Option<&str>,
        mode: Mode,
    ) -> Result<Resolution, EnvironmentError> {
        let explicit_env = env_name.filter(|name| !name.trim().is_empty());
        let on_substrate = if mode == Mode::Dev || explicit_env.is_some() {
            false
        } else {
            self.metadata.on_substrate().await
        };

        let context = DeploymentContext::classify(explicit_env, mode, on_substrate);
        tracing::info!(
            %context,
            %mode,
            env = explicit_env.unwrap_or(""),
            on_substrate,
            "Deployment context resolved"
        );

        if !context.is_managed() {
            return Ok(Resolution {
                context,
                env: EnvConfig::default(),
            });
        }

        let env = self.managed_env().await?;
        Ok(Resolution { context, env })
    }

    async fn managed_env(&self) -> Result<EnvConfig, EnvironmentError> {
        let project_id = self
            .metadata
            .project_id()
            .await
            .map_err(EnvironmentError::ProjectId)?;

        let path = find_catalog_file(self.catalog_path.as_deref())?;
        let catalog = load_catalog(&path)?;
        tracing::debug!(path = %path.display(), "Environment catalog loaded");

        let build_env = catalog
            .by_project_id(&project_id)
            .ok_or_else(|| EnvironmentError::UnknownProject {
                project_id: project_id.clone(),
            })?;

        let backend_service_id = build_env
            .iap_service_id(IAP_BACKEND)
            .and_then(BackendServiceId::new)
            .ok_or_else(|| EnvironmentError::MissingBackendServiceId {
                env: build_env.name.clone(),
                backend: IAP_BACKEND,
            })?;

        tracing::info!(
            env = %build_env.name,
            project_id = %project_id,
            bucket = %build_env.gomote_transfer_bucket,
            "Managed environment resolved"
        );

        Ok(EnvConfig {
            name: build_env.name.clone(),
            project_id,
            gomote_bucket: build_env.gomote_transfer_bucket.clone(),
            backend_service_id: Some(backend_service_id),
        })
    }
}
