//! Startup configuration for the gomote server.
//!
//! All flag- and environment-backed configuration is read exactly once by the
//! binary and handed around as a plain [`ServerSettings`] value. Nothing in
//! this crate reads process-wide mutable state after startup.
//!
//! The environment catalog (project id → bucket and IAP backend ids) lives in
//! [`catalog`] and is only consulted when the process runs managed.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::secret::SecretValue;
use crate::telemetry::LogFormat;

pub mod catalog;
pub mod error;

pub use catalog::{BuildEnv, EnvCatalog, find_catalog_file, load_catalog};
pub use error::CatalogError;

/// Default address of the primary (RPC + status) listener.
pub const DEFAULT_LISTEN_ADDR: &str = ":8080";

/// Default address of the SSH listener.
pub const DEFAULT_SSH_ADDR: &str = ":2222";

/// Default bound on object-storage client construction.
pub const DEFAULT_STORAGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on remote-configuration client construction.
pub const DEFAULT_CONFIG_TIMEOUT: Duration = Duration::from_secs(10);

/// Operator-selected run mode.
///
/// `Dev` means localhost development. It is not the same thing as running
/// against the staging project, which still resolves as a production-like
/// deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Local development: no metadata lookups, ephemeral shell keys allowed.
    Dev,
    /// Production behaviour requested explicitly.
    Prod,
    /// Detect from the runtime substrate.
    #[default]
    Auto,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dev => write!(f, "dev"),
            Self::Prod => write!(f, "prod"),
            Self::Auto => write!(f, "auto"),
        }
    }
}

/// Fully resolved startup settings.
///
/// Built once from CLI flags and environment fallbacks, then passed by value
/// into the bootstrap sequence.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Address of the primary listener (a bare `:port` is accepted).
    pub listen_addr: String,
    /// Address of the SSH listener.
    pub ssh_addr: String,
    /// Explicit build environment name. `None` means auto-detect.
    pub env_name: Option<String>,
    /// Run mode.
    pub mode: Mode,
    /// Explicit environment catalog path.
    pub env_catalog: Option<PathBuf>,
    /// Directory holding mounted secret files.
    pub secrets_dir: Option<PathBuf>,
    /// SSH host private key supplied directly (flag or environment).
    pub ssh_private_key: Option<SecretValue>,
    /// SSH host public key supplied directly (flag or environment).
    pub ssh_public_key: Option<SecretValue>,
    /// Bound on object-storage client construction.
    pub storage_timeout: Duration,
    /// Bound on remote-configuration client construction.
    pub config_timeout: Duration,
    /// Log output format.
    pub log_format: LogFormat,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            ssh_addr: DEFAULT_SSH_ADDR.to_string(),
            env_name: None,
            mode: Mode::Auto,
            env_catalog: None,
            secrets_dir: None,
            ssh_private_key: None,
            ssh_public_key: None,
            storage_timeout: DEFAULT_STORAGE_TIMEOUT,
            config_timeout: DEFAULT_CONFIG_TIMEOUT,
            log_format: LogFormat::Json,
        }
    }
}

impl ServerSettings {
    /// Settings for local development on the given addresses.
    #[must_use]
    pub fn local_dev(listen_addr: impl Into<String>, ssh_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            ssh_addr: ssh_addr.into(),
            mode: Mode::Dev,
            log_format: LogFormat::Compact,
            ..Self::default()
        }
    }

    /// The explicit environment name, with empty values treated as absent.
    #[must_use]
    pub fn explicit_env(&self) -> Option<&str> {
        self.env_name.as_deref().filter(|name| !name.trim().is_empty())
    }
}

/// Expand a bare `:port` listen address to all interfaces.
///
/// `":2222"` binds every interface; anything else is passed through for the
/// socket layer to resolve.
#[must_use]
pub fn normalize_listen_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}
