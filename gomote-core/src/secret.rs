//! Secret access.
//!
//! The server reads at most two secrets, the SSH host key pair, and treats
//! both as optional. A secret that does not exist is `Ok(None)`; every other
//! failure is an error the bootstrap sequence refuses to start on.
//!
//! Secrets live as one file per name inside a mounted directory, which is how
//! the deployment exposes its secret manager to the container.

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use zeroize::Zeroizing;

/// Secret holding the SSH host private key.
pub const SSH_PRIVATE_KEY_SECRET: &str = "gomote-ssh-private-key";

/// Secret holding the SSH host public key.
pub const SSH_PUBLIC_KEY_SECRET: &str = "gomote-ssh-public-key";

/// Bound on a single secret retrieval.
pub const SECRET_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Secret material. Zeroised on drop and never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretValue(Zeroizing<String>);

impl SecretValue {
    /// Wrap a secret string.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    /// Borrow the secret text.
    #[must_use]
    pub fn expose(&self) -> &str {
        self.0.as_str()
    }

    /// True when the secret is empty or whitespace.
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretValue(<redacted>)")
    }
}

impl From<String> for SecretValue {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Secret access errors.
#[derive(Debug, Error)]
pub enum SecretError {
    /// The configured secrets directory is unusable.
    #[error("secrets directory {} is not a readable directory", path.display())]
    InvalidDirectory {
        /// The configured path.
        path: PathBuf,
    },

    /// Reading a secret failed for a reason other than absence.
    #[error("failed to read secret '{name}'")]
    Read {
        /// Secret name.
        name: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Secret retrieval did not finish in time.
    #[error("timed out after {timeout:?} retrieving secret '{name}'")]
    Timeout {
        /// Secret name.
        name: String,
        /// Bound that was exceeded.
        timeout: Duration,
    },
}

/// Source of named secrets.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetch a secret by name. `Ok(None)` means it does not exist.
    async fn retrieve(&self, name: &str) -> Result<Option<SecretValue>, SecretError>;
}

/// Secrets mounted as files in a directory.
#[derive(Debug, Clone)]
pub struct DirectorySecretStore {
    root: PathBuf,
}

impl DirectorySecretStore {
    /// Open a store rooted at `root`. The directory must exist.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, SecretError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(SecretError::InvalidDirectory { path: root });
        }
        Ok(Self { root })
    }

    /// Directory the store reads from.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl SecretStore for DirectorySecretStore {
    async fn retrieve(&self, name: &str) -> Result<Option<SecretValue>, SecretError> {
        let path = self.root.join(name);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                let value = SecretValue::new(contents);
                if value.is_blank() {
                    Ok(None)
                } else {
                    Ok(Some(value))
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(SecretError::Read {
                name: name.to_string(),
                source,
            }),
        }
    }
}

/// Store used when no secrets directory is configured. Every secret is absent.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSecretStore;

#[async_trait]
impl SecretStore for NoSecretStore {
    async fn retrieve(&self, _name: &str) -> Result<Option<SecretValue>, SecretError> {
        Ok(None)
    }
}

/// Initialise secret access for the configured directory.
pub fn init_secret_store(dir: Option<&Path>) -> Result<Arc<dyn SecretStore>, SecretError> {
    match dir {
        Some(dir) => {
            let store = DirectorySecretStore::open(dir)?;
            tracing::info!(dir = %store.root().display(), "Secret store initialised");
            Ok(Arc::new(store))
        }
        None => {
            tracing::debug!("No secrets directory configured");
            Ok(Arc::new(NoSecretStore))
        }
    }
}

/// Retrieve one secret under a deadline.
pub async fn fetch_secret(
    store: &dyn SecretStore,
    name: &str,
    timeout: Duration,
) -> Result<Option<SecretValue>, SecretError> {
    match tokio::time::timeout(timeout, store.retrieve(name)).await {
        Ok(result) => result,
        Err(_) => Err(SecretError::Timeout {
            name: name.to_string(),
            timeout,
        }),
    }
}
