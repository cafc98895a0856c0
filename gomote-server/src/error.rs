//! Startup error types for the gomote server.

use std::error::Error as StdError;
use std::fmt::Write as _;

use gomote_core::environment::EnvironmentError;
use gomote_core::secret::SecretError;
use gomote_core::shell::KeyGenError;
use thiserror::Error;

use crate::clients::ClientError;

/// Every reason the server stops. Each one exits the process non-zero.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// Secret access could not be initialised.
    #[error("failed to initialise secret access")]
    SecretStore(#[source] SecretError),

    /// A secret could not be read.
    #[error("failed to retrieve secret '{name}'")]
    Secret {
        /// Secret name.
        name: &'static str,
        /// Retrieval error.
        #[source]
        source: SecretError,
    },

    /// The SSH certificate authority key could not be created.
    #[error("unable to create SSH certificate authority")]
    CertificateAuthority(#[source] KeyGenError),

    /// Environment resolution failed.
    #[error("failed to resolve deployment environment")]
    Environment(#[from] EnvironmentError),

    /// An auxiliary client could not be built.
    #[error("failed to create auxiliary client")]
    Client(#[from] ClientError),

    /// The primary listener could not bind.
    #[error("failed to bind primary listener on {addr}")]
    Bind {
        /// Address requested.
        addr: String,
        /// Bind error.
        #[source]
        source: std::io::Error,
    },

    /// The primary listener stopped serving.
    #[error("primary listener stopped: {reason}")]
    ListenerStopped {
        /// Why serving ended.
        reason: &'static str,
    },
}

/// Render an error and its `source` chain on one line.
pub fn error_chain(error: &dyn StdError) -> String {
    let mut out = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        let _ = write!(out, ": {cause}");
        source = cause.source();
    }
    out
}
