//! Build environment catalog.
//!
//! A managed deployment learns its project id from the metadata substrate and
//! then needs two project-specific values: the bucket used for gomote file
//! transfers, and the IAP service id of each load-balancer backend. Those come
//! from a YAML catalog:
//!
//! ```yaml
//! environments:
//!   - name: prod
//!     project_id: example-prod
//!     gomote_transfer_bucket: gomote-transfer
//!     iap_service_ids:
//!       coordinator-internal-iap: "1234567890"
//! ```
//!
//! # Search order
//!
//! 1. Explicit path (`--env-catalog`)
//! 2. `GOMOTE_ENV_CATALOG` environment variable
//! 3. `/etc/gomote/environments.yaml`
//! 4. `./environments.yaml`

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::error::CatalogError;

/// Environment variable naming the catalog file.
pub const CATALOG_ENV_VAR: &str = "GOMOTE_ENV_CATALOG";

/// One build environment.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BuildEnv {
    /// Short environment name, e.g. `prod` or `staging`.
    pub name: String,
    /// Cloud project id the environment runs in.
    pub project_id: String,
    /// Bucket used for gomote file transfers.
    #[serde(default)]
    pub gomote_transfer_bucket: String,
    /// IAP service id per backend service name.
    #[serde(default)]
    pub iap_service_ids: BTreeMap<String, String>,
}

impl BuildEnv {
    /// IAP service id for a backend, if one is configured and non-empty.
    #[must_use]
    pub fn iap_service_id(&self, backend: &str) -> Option<&str> {
        self.iap_service_ids
            .get(backend)
            .map(String::as_str)
            .filter(|id| !id.trim().is_empty())
    }
}

/// All known build environments.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnvCatalog {
    /// Catalog entries.
    #[serde(default)]
    pub environments: Vec<BuildEnv>,
}

impl EnvCatalog {
    /// Parse a catalog from YAML text.
    pub fn from_yaml(contents: &str) -> Result<Self, CatalogError> {
        let catalog: Self = serde_saphyr::from_str(contents)?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Look up the environment for a project id.
    #[must_use]
    pub fn by_project_id(&self, project_id: &str) -> Option<&BuildEnv> {
        self.environments
            .iter()
            .find(|env| env.project_id == project_id)
    }

    fn validate(&self) -> Result<(), CatalogError> {
        let mut seen = HashSet::new();
        for env in &self.environments {
            if !seen.insert(env.project_id.as_str()) {
                return Err(CatalogError::DuplicateProject {
                    project_id: env.project_id.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Catalog search paths in priority order, excluding an explicit path.
#[must_use]
pub fn default_catalog_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if let Ok(path) = std::env::var(CATALOG_ENV_VAR)
        && !path.trim().is_empty()
    {
        paths.push(PathBuf::from(path));
    }

    paths.push(PathBuf::from("/etc/gomote/environments.yaml"));
    paths.push(PathBuf::from("./environments.yaml"));

    paths
}

/// Find the first existing catalog file.
pub fn find_catalog_file(explicit_path: Option<&Path>) -> Result<PathBuf, CatalogError> {
    if let Some(path) = explicit_path {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        return Err(CatalogError::NotFound {
            searched: vec![path.to_path_buf()],
        });
    }

    let paths = default_catalog_paths();
    for path in &paths {
        if path.exists() {
            return Ok(path.clone());
        }
    }

    Err(CatalogError::NotFound { searched: paths })
}

/// Read and parse the catalog at `path`.
pub fn load_catalog(path: &Path) -> Result<EnvCatalog, CatalogError> {
    let contents = std::fs::read_to_string(path)?;
    if contents.trim().is_empty() {
        return Err(CatalogError::Empty {
            path: path.to_path_buf(),
        });
    }
    EnvCatalog::from_yaml(&contents)
}
