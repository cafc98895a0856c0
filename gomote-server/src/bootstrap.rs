//! Startup sequencing.
//!
//! [`Bootstrap::prepare`] performs every startup step up to, but not
//! including, serving the primary listener:
//!
//! 1. secret access, plus the optional SSH host key secrets
//! 2. session pool and scheduler
//! 3. SSH certificate authority
//! 4. deployment environment and RPC auth policy
//! 5. RPC server with the policy's interceptors
//! 6. storage and config clients, each under its own deadline
//! 7. multiplexer in front of the RPC server and the status page
//! 8. shell subsystem, whose failure only disables the shell
//!
//! Any failure in steps 1-7 is fatal. [`Server::serve_on`] is step 9: it blocks
//! on the primary listener, and whenever it returns the server is going down.

use std::sync::Arc;

use axum::Router;
use gomote_core::auth::{AssertionVerifier, JwksVerifier};
use gomote_core::config::normalize_listen_addr;
use gomote_core::environment::{GceMetadataClient, MetadataClient};
use gomote_core::remote::{Scheduler, SessionPool};
use gomote_core::secret::{
    SECRET_FETCH_TIMEOUT, SSH_PRIVATE_KEY_SECRET, SSH_PUBLIC_KEY_SECRET, SecretStore, SecretValue,
    fetch_secret, init_secret_store,
};
use gomote_core::shell::{
    self, CertificateAuthority, DisconnectingSessionHandler, SessionHandler, ShellSettings,
};
use gomote_core::{AuthPolicy, EnvironmentResolver, Resolution, ServerSettings, SubsystemHandle};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::{HttpMakeClassifier, Trace, TraceLayer};
use tracing::{debug, info, warn};

use crate::clients::{ClientFactory, HttpClientFactory, build_clients};
use crate::error::{BootstrapError, error_chain};
use crate::mux::Multiplexer;
use crate::rpc::{RpcHandler, RpcServer};
use crate::serve;
use crate::service::GomoteService;
use crate::status;

/// The service stack on the primary listener.
pub type FrontDoor = Trace<Multiplexer<RpcServer, Router>, HttpMakeClassifier>;

/// External collaborators the bootstrap sequence wires together.
///
/// Optional entries fall back to the production implementation, built from
/// state that only exists partway through startup.
pub struct Collaborators {
    metadata: Arc<dyn MetadataClient>,
    verifier: Arc<dyn AssertionVerifier>,
    client_factory: Option<Arc<dyn ClientFactory>>,
    rpc_handler: Option<Arc<dyn RpcHandler>>,
    session_handler: Option<Arc<dyn SessionHandler>>,
}

impl Collaborators {
    /// Collaborators with the given metadata client and assertion verifier.
    #[must_use]
    pub fn new(metadata: Arc<dyn MetadataClient>, verifier: Arc<dyn AssertionVerifier>) -> Self {
        Self {
            metadata,
            verifier,
            client_factory: None,
            rpc_handler: None,
            session_handler: None,
        }
    }

    /// Real metadata server and IAP key set.
    #[must_use]
    pub fn production() -> Self {
        Self::new(
            Arc::new(GceMetadataClient::from_env()),
            Arc::new(JwksVerifier::new()),
        )
    }

    /// Replace the auxiliary client factory.
    #[must_use]
    pub fn with_client_factory(mut self, factory: Arc<dyn ClientFactory>) -> Self {
        self.client_factory = Some(factory);
        self
    }

    /// Replace the gomote service behind the interceptors.
    #[must_use]
    pub fn with_rpc_handler(mut self, handler: Arc<dyn RpcHandler>) -> Self {
        self.rpc_handler = Some(handler);
        self
    }

    /// Replace the shell session handler.
    #[must_use]
    pub fn with_session_handler(mut self, handler: Arc<dyn SessionHandler>) -> Self {
        self.session_handler = Some(handler);
        self
    }
}

/// Startup sequence for one server process.
pub struct Bootstrap {
    settings: ServerSettings,
    collaborators: Collaborators,
    shutdown: CancellationToken,
}

impl Bootstrap {
    /// Sequence for `settings`, stopping when `shutdown` is cancelled.
    #[must_use]
    pub fn new(
        settings: ServerSettings,
        collaborators: Collaborators,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            settings,
            collaborators,
            shutdown,
        }
    }

    /// Run steps 1-8.
    pub async fn prepare(self) -> Result<Server, BootstrapError> {
        let Self {
            settings,
            collaborators,
            shutdown,
        } = self;

        // 1. Secrets.
        let secrets =
            init_secret_store(settings.secrets_dir.as_deref()).map_err(BootstrapError::SecretStore)?;
        let private_key = resolve_secret(
            settings.ssh_private_key.clone(),
            secrets.as_ref(),
            SSH_PRIVATE_KEY_SECRET,
        )
        .await?;
        let public_key = resolve_secret(
            settings.ssh_public_key.clone(),
            secrets.as_ref(),
            SSH_PUBLIC_KEY_SECRET,
        )
        .await?;

        // 2. Session pool and scheduler.
        let pool = Arc::new(SessionPool::new());
        let scheduler = Arc::new(Scheduler::new(pool.clone()));

        // 3. Certificate authority.
        let ca = Arc::new(
            CertificateAuthority::generate().map_err(BootstrapError::CertificateAuthority)?,
        );
        info!(ca_key = %ca.authorized_key(), "SSH certificate authority ready");

        // 4. Environment and auth policy.
        let resolver = EnvironmentResolver::new(
            collaborators.metadata.clone(),
            settings.env_catalog.clone(),
        );
        let resolution = resolver
            .resolve(settings.explicit_env(), settings.mode)
            .await?;
        let policy = AuthPolicy::select(
            resolution.context,
            &resolution.env,
            collaborators.verifier.clone(),
        )?;

        // 5. RPC server.
        let rpc = RpcServer::new(policy);

        // 6. Auxiliary clients.
        let factory: Arc<dyn ClientFactory> = match collaborators.client_factory.clone() {
            Some(factory) => factory,
            None => Arc::new(HttpClientFactory::new(
                collaborators.metadata.clone(),
                resolution.context,
            )),
        };
        let (storage, config) = build_clients(
            factory.as_ref(),
            &resolution.env.gomote_bucket,
            settings.storage_timeout,
            settings.config_timeout,
        )
        .await?;

        let handler: Arc<dyn RpcHandler> = match collaborators.rpc_handler.clone() {
            Some(handler) => handler,
            None => {
                let service = GomoteService::new(
                    pool.clone(),
                    scheduler,
                    ca.clone(),
                    resolution.env.gomote_bucket.clone(),
                    storage,
                    config,
                );
                debug!(service = ?service, "gomote service wired");
                Arc::new(service)
            }
        };
        let rpc = rpc.with_handler(handler);

        // 7. Multiplexer.
        let front_door = ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .service(Multiplexer::new(rpc, status::router()));

        // 8. Shell subsystem.
        let session_handler: Arc<dyn SessionHandler> = match collaborators.session_handler.clone() {
            Some(handler) => handler,
            None => Arc::new(DisconnectingSessionHandler::new(pool.clone())),
        };
        let shell_settings = ShellSettings {
            addr: settings.ssh_addr.clone(),
            private_key,
            public_key,
        };
        let shell = match shell::start(&shell_settings, resolution.context, ca, session_handler) {
            Ok(handle) => {
                info!(addr = %handle.addr(), "Running SSH server");
                Some(handle)
            }
            Err(e) => {
                warn!(error = %error_chain(&e), "Unable to configure SSH server; continuing without it");
                None
            }
        };

        Ok(Server {
            listen_addr: normalize_listen_addr(&settings.listen_addr),
            resolution,
            front_door,
            shell,
            shutdown,
        })
    }
}

async fn resolve_secret(
    supplied: Option<SecretValue>,
    store: &dyn SecretStore,
    name: &'static str,
) -> Result<Option<SecretValue>, BootstrapError> {
    if let Some(value) = supplied.filter(|v| !v.is_blank()) {
        return Ok(Some(value));
    }
    fetch_secret(store, name, SECRET_FETCH_TIMEOUT)
        .await
        .map_err(|source| BootstrapError::Secret { name, source })
}

/// A prepared server, ready to block on the primary listener.
pub struct Server {
    listen_addr: String,
    resolution: Resolution,
    front_door: FrontDoor,
    shell: Option<SubsystemHandle>,
    shutdown: CancellationToken,
}

impl Server {
    /// Resolved deployment.
    #[must_use]
    pub fn resolution(&self) -> &Resolution {
        &self.resolution
    }

    /// Shell subsystem handle, if it started.
    #[must_use]
    pub fn shell(&self) -> Option<&SubsystemHandle> {
        self.shell.as_ref()
    }

    /// Bind the configured address and serve it.
    pub async fn run(self) -> BootstrapError {
        match TcpListener::bind(&self.listen_addr).await {
            Ok(listener) => self.serve_on(listener).await,
            Err(source) => {
                let addr = self.listen_addr.clone();
                close_shell(self.shell).await;
                BootstrapError::Bind { addr, source }
            }
        }
    }

    /// Serve `listener` until shutdown. Always returns an error.
    pub async fn serve_on(self, listener: TcpListener) -> BootstrapError {
        let Self {
            front_door,
            shell,
            shutdown,
            ..
        } = self;

        serve::serve(listener, front_door, shutdown).await;
        close_shell(shell).await;
        BootstrapError::ListenerStopped {
            reason: "shutdown signal received",
        }
    }
}

async fn close_shell(shell: Option<SubsystemHandle>) {
    if let Some(handle) = shell {
        handle.close().await;
    }
}

/// Prepare and serve. Returns only when the server is going down.
pub async fn run(
    settings: ServerSettings,
    collaborators: Collaborators,
    shutdown: CancellationToken,
) -> BootstrapError {
    match Bootstrap::new(settings, collaborators, shutdown).prepare().await {
        Ok(server) => server.run().await,
        Err(e) => e,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{ClientError, ConfigClient, StorageClient};
    use async_trait::async_trait;
    use gomote_core::auth::{AudienceValidation, CallerIdentity, VerifyError};
    use gomote_core::environment::MetadataError;
    use gomote_core::shell::{ShellKeyPair, ShellStatus};
    use gomote_core::{DeploymentContext, Mode};
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FakeMetadata {
        on_substrate: bool,
        project_id: &'static str,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MetadataClient for FakeMetadata {
        async fn on_substrate(&self) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.on_substrate
        }
        async fn project_id(&self) -> Result<String, MetadataError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.project_id.to_string())
        }
        async fn access_token(&self) -> Result<SecretValue, MetadataError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(SecretValue::new("token"))
        }
    }

    struct NeverVerifies;

    #[async_trait]
    impl AssertionVerifier for NeverVerifies {
        async fn verify(
            &self,
            _assertion: &str,
            _audience: &AudienceValidation,
        ) -> Result<CallerIdentity, VerifyError> {
            Err(VerifyError::MissingKeyId)
        }
    }

    struct StallingStorage;

    #[async_trait]
    impl ClientFactory for StallingStorage {
        async fn storage(&self, _bucket: &str) -> Result<StorageClient, ClientError> {
            std::future::pending().await
        }
        async fn config(&self) -> Result<ConfigClient, ClientError> {
            std::future::pending().await
        }
    }

    fn metadata(on_substrate: bool, project_id: &'static str) -> Arc<FakeMetadata> {
        Arc::new(FakeMetadata {
            on_substrate,
            project_id,
            calls: AtomicUsize::new(0),
        })
    }

    fn collaborators(metadata: Arc<FakeMetadata>) -> Collaborators {
        Collaborators::new(metadata, Arc::new(NeverVerifies))
    }

    fn dev_settings() -> ServerSettings {
        ServerSettings::local_dev("127.0.0.1:0", "127.0.0.1:0")
    }

    async fn prepare(
        settings: ServerSettings,
        collaborators: Collaborators,
    ) -> Result<Server, BootstrapError> {
        Bootstrap::new(settings, collaborators, CancellationToken::new())
            .prepare()
            .await
    }

    #[tokio::test]
    async fn test_dev_mode_starts_everything_without_metadata() {
        let meta = metadata(true, "example-prod");
        let server = prepare(dev_settings(), collaborators(meta.clone()))
            .await
            .unwrap();

        assert_eq!(server.resolution().context, DeploymentContext::LocalDev);
        assert_eq!(meta.calls.load(Ordering::SeqCst), 0);

        let shell = server.shell().expect("shell should start in dev mode");
        assert!(shell.credentials().ephemeral);
        let status = shell.ready(Duration::from_secs(5)).await;
        assert!(matches!(status, ShellStatus::Running { .. }), "{status}");
    }

    #[tokio::test]
    async fn test_forced_prod_without_keys_runs_without_shell() {
        let mut settings = dev_settings();
        settings.mode = Mode::Prod;
        settings.env_name = Some("staging".to_string());

        let server = prepare(settings, collaborators(metadata(false, "")))
            .await
            .unwrap();
        assert_eq!(server.resolution().context, DeploymentContext::ForcedProd);
        assert!(server.shell().is_none());
    }

    #[tokio::test]
    async fn test_keys_from_secrets_dir() {
        let keys = ShellKeyPair::generate().unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(SSH_PRIVATE_KEY_SECRET), keys.private_pem()).unwrap();
        std::fs::write(dir.path().join(SSH_PUBLIC_KEY_SECRET), keys.authorized_key()).unwrap();

        let mut settings = dev_settings();
        settings.mode = Mode::Prod;
        settings.env_name = Some("staging".to_string());
        settings.secrets_dir = Some(dir.path().to_path_buf());

        let server = prepare(settings, collaborators(metadata(false, "")))
            .await
            .unwrap();
        let shell = server.shell().expect("supplied keys should start the shell");
        assert!(!shell.credentials().ephemeral);
        assert_eq!(shell.credentials().host.authorized_key(), keys.authorized_key());
    }

    #[tokio::test]
    async fn test_bad_secrets_dir_is_fatal() {
        let mut settings = dev_settings();
        settings.secrets_dir = Some("/nonexistent/gomote-secrets".into());
        let err = prepare(settings, collaborators(metadata(false, "")))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BootstrapError::SecretStore(_)));
    }

    #[tokio::test]
    async fn test_managed_unknown_project_is_fatal() {
        let mut catalog = tempfile::NamedTempFile::new().unwrap();
        catalog
            .write_all(b"environments:\n  - name: prod\n    project_id: example-prod\n")
            .unwrap();
        let mut settings = dev_settings();
        settings.mode = Mode::Auto;
        settings.env_catalog = Some(catalog.path().to_path_buf());

        let err = prepare(settings, collaborators(metadata(true, "somebody-else")))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BootstrapError::Environment(_)));
    }

    #[tokio::test]
    async fn test_managed_installs_iap_policy() {
        let mut catalog = tempfile::NamedTempFile::new().unwrap();
        catalog
            .write_all(
                b"environments:\n  - name: prod\n    project_id: example-prod\n    \
                  gomote_transfer_bucket: gomote-transfer\n    iap_service_ids:\n      \
                  coordinator-internal-iap: \"42\"\n",
            )
            .unwrap();
        let mut settings = dev_settings();
        settings.mode = Mode::Auto;
        settings.env_catalog = Some(catalog.path().to_path_buf());

        let server = prepare(settings, collaborators(metadata(true, "example-prod")))
            .await
            .unwrap();
        assert_eq!(server.resolution().context, DeploymentContext::Managed);
        assert_eq!(server.resolution().env.gomote_bucket, "gomote-transfer");
        assert!(!server.front_door.get_ref().rpc().policy().is_empty());
        // Managed without supplied keys: no shell.
        assert!(server.shell().is_none());
    }

    #[tokio::test]
    async fn test_client_deadline_is_fatal() {
        let mut settings = dev_settings();
        settings.storage_timeout = Duration::from_millis(20);
        let collaborators =
            collaborators(metadata(false, "")).with_client_factory(Arc::new(StallingStorage));

        let err = prepare(settings, collaborators).await.err().unwrap();
        assert!(matches!(
            err,
            BootstrapError::Client(ClientError::Timeout { client: "storage", .. })
        ));
    }

    #[tokio::test]
    async fn test_serve_returns_error_and_closes_shell() {
        let shutdown = CancellationToken::new();
        let server = Bootstrap::new(
            dev_settings(),
            collaborators(metadata(false, "")),
            shutdown.clone(),
        )
        .prepare()
        .await
        .unwrap();

        let ShellStatus::Running { local_addr } = server
            .shell()
            .unwrap()
            .ready(Duration::from_secs(5))
            .await
        else {
            panic!("shell did not start");
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let task = tokio::spawn(server.serve_on(listener));
        shutdown.cancel();

        let err = tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(err, BootstrapError::ListenerStopped { .. }));
        // Shell port released.
        TcpListener::bind(local_addr).await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_failure_is_fatal() {
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut settings = dev_settings();
        settings.listen_addr = occupied.local_addr().unwrap().to_string();

        let err = run(settings, collaborators(metadata(false, "")), CancellationToken::new()).await;
        assert!(matches!(err, BootstrapError::Bind { .. }));
    }
}
