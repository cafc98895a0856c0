//! Shell subsystem lifecycle.
//!
//! # Credential policy
//!
//! | host keys supplied | context       | outcome                         |
//! |--------------------|---------------|---------------------------------|
//! | both               | any           | start with the supplied pair    |
//! | either missing     | `LocalDev`    | generate an ephemeral pair      |
//! | either missing     | anything else | error, subsystem stays disabled |
//!
//! A started subsystem runs in its own task. Bind failures and accept-loop
//! errors end that task and are recorded in its [`ShellStatus`]; they never
//! reach the caller that started it.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::server::{self, SessionHandler};
use super::{CertificateAuthority, KeyGenError, ShellCredentials, ShellKeyPair};
use crate::config::normalize_listen_addr;
use crate::environment::DeploymentContext;
use crate::secret::SecretValue;

/// Bound on waiting for the shell task during [`SubsystemHandle::close`].
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Shell configuration failures. None of these stop the process.
#[derive(Debug, Error)]
pub enum ShellError {
    /// Host keys were not supplied and may not be generated here.
    #[error("SSH host keys not configured and ephemeral keys are not allowed in {context} context")]
    MissingKeys {
        /// Context that forbade generation.
        context: DeploymentContext,
    },

    /// The supplied public key is not an `authorized_keys` line.
    #[error("SSH host public key is malformed")]
    InvalidPublicKey,

    /// The supplied private key is empty.
    #[error("SSH host private key is empty")]
    InvalidPrivateKey,

    /// Generating an ephemeral key pair failed.
    #[error("failed to generate SSH host key pair")]
    KeyGen(#[from] KeyGenError),
}

/// Inputs to the shell subsystem.
#[derive(Debug, Clone)]
pub struct ShellSettings {
    /// Listen address (a bare `:port` is accepted).
    pub addr: String,
    /// Supplied host private key.
    pub private_key: Option<SecretValue>,
    /// Supplied host public key.
    pub public_key: Option<SecretValue>,
}

/// Observable state of a started shell subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellStatus {
    /// Task spawned, listener not yet bound.
    Starting,
    /// Accepting connections.
    Running {
        /// Address the listener is bound to.
        local_addr: SocketAddr,
    },
    /// Stopped on its own after an error.
    Terminated {
        /// What went wrong.
        reason: String,
    },
    /// Stopped by cancellation.
    Closed,
}

impl ShellStatus {
    /// True once the task is no longer accepting.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Terminated { .. } | Self::Closed)
    }
}

impl fmt::Display for ShellStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Running { local_addr } => write!(f, "running on {local_addr}"),
            Self::Terminated { reason } => write!(f, "terminated: {reason}"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Lock-free status cell with change notification. Single writer: the shell task.
#[derive(Debug)]
pub(crate) struct StatusCell {
    current: ArcSwap<ShellStatus>,
    changed: Notify,
}

impl StatusCell {
    fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(ShellStatus::Starting),
            changed: Notify::new(),
        }
    }

    fn get(&self) -> ShellStatus {
        self.current.load_full().as_ref().clone()
    }

    fn set(&self, status: ShellStatus) {
        self.current.store(Arc::new(status));
        self.changed.notify_waiters();
    }

    async fn wait_for(&self, done: impl Fn(&ShellStatus) -> bool) -> ShellStatus {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let status = self.get();
            if done(&status) {
                return status;
            }
            notified.await;
        }
    }
}

/// Decide which host keys the shell server uses.
pub fn configure_credentials(
    settings: &ShellSettings,
    context: DeploymentContext,
    ca: Arc<CertificateAuthority>,
) -> Result<ShellCredentials, ShellError> {
    let supplied = settings
        .private_key
        .as_ref()
        .filter(|k| !k.is_blank())
        .zip(settings.public_key.as_ref().filter(|k| !k.is_blank()));

    let (host, ephemeral) = match supplied {
        Some((private_key, public_key)) => (
            ShellKeyPair::from_parts(private_key.expose(), public_key.expose())?,
            false,
        ),
        None if context.allows_ephemeral_keys() => {
            tracing::info!(%context, "SSH host keys not supplied; generating ephemeral pair");
            (ShellKeyPair::generate()?, true)
        }
        None => return Err(ShellError::MissingKeys { context }),
    };

    Ok(ShellCredentials {
        host,
        ca,
        ephemeral,
    })
}

/// Configure and spawn the shell subsystem.
///
/// Must be called from within a Tokio runtime. On success the returned
/// handle owns the running task; on error nothing was spawned.
pub fn start(
    settings: &ShellSettings,
    context: DeploymentContext,
    ca: Arc<CertificateAuthority>,
    handler: Arc<dyn SessionHandler>,
) -> Result<SubsystemHandle, ShellError> {
    let credentials = Arc::new(configure_credentials(settings, context, ca)?);
    let addr = normalize_listen_addr(&settings.addr);
    let status = Arc::new(StatusCell::new());
    let shutdown = CancellationToken::new();

    let task = tokio::spawn(run(
        addr.clone(),
        credentials.clone(),
        handler,
        status.clone(),
        shutdown.clone(),
    ));

    Ok(SubsystemHandle {
        addr,
        status,
        shutdown,
        task: Some(task),
        credentials,
    })
}

async fn run(
    addr: String,
    credentials: Arc<ShellCredentials>,
    handler: Arc<dyn SessionHandler>,
    status: Arc<StatusCell>,
    shutdown: CancellationToken,
) {
    let listener = tokio::select! {
        result = TcpListener::bind(&addr) => result,
        _ = shutdown.cancelled() => {
            status.set(ShellStatus::Closed);
            return;
        }
    };

    let bound = listener.and_then(|l| l.local_addr().map(|local_addr| (l, local_addr)));
    let (listener, local_addr) = match bound {
        Ok(bound) => bound,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "SSH server failed to bind");
            status.set(ShellStatus::Terminated {
                reason: format!("bind {addr}: {e}"),
            });
            return;
        }
    };

    tracing::info!(
        addr = %local_addr,
        ephemeral_keys = credentials.ephemeral,
        "SSH server listening"
    );
    status.set(ShellStatus::Running { local_addr });

    match server::serve(listener, credentials, handler, shutdown).await {
        Ok(()) => {
            tracing::info!("SSH server stopped");
            status.set(ShellStatus::Closed);
        }
        Err(e) => {
            tracing::error!(error = %e, "SSH server terminated");
            status.set(ShellStatus::Terminated {
                reason: e.to_string(),
            });
        }
    }
}

/// Handle to a started shell subsystem.
///
/// Dropping the handle signals the task to stop. [`SubsystemHandle::close`]
/// additionally waits for it.
pub struct SubsystemHandle {
    addr: String,
    status: Arc<StatusCell>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
    credentials: Arc<ShellCredentials>,
}

impl SubsystemHandle {
    /// Configured listen address.
    #[must_use]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> ShellStatus {
        self.status.get()
    }

    /// Credentials the server runs with.
    #[must_use]
    pub fn credentials(&self) -> &ShellCredentials {
        &self.credentials
    }

    /// Wait until the task has bound or given up, for at most `timeout`.
    pub async fn ready(&self, timeout: Duration) -> ShellStatus {
        let wait = self
            .status
            .wait_for(|s| !matches!(s, ShellStatus::Starting));
        tokio::time::timeout(timeout, wait)
            .await
            .unwrap_or_else(|_| self.status())
    }

    /// Stop the subsystem and wait (bounded) for its task to finish.
    ///
    /// The listener and key material are released once this returns.
    pub async fn close(mut self) {
        self.shutdown.cancel();

        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(CLOSE_TIMEOUT, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "SSH server task failed"),
                Err(_) => {
                    tracing::warn!(
                        timeout_secs = CLOSE_TIMEOUT.as_secs(),
                        "SSH server did not stop in time; aborting"
                    );
                    task.abort();
                    let _ = task.await;
                }
            }
        }

        if !self.status.get().is_stopped() {
            self.status.set(ShellStatus::Closed);
        }
        tracing::info!(status = %self.status.get(), "SSH server closed");
    }
}

impl fmt::Debug for SubsystemHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubsystemHandle")
            .field("addr", &self.addr)
            .field("status", &self.status.get())
            .finish_non_exhaustive()
    }
}

impl Drop for SubsystemHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
