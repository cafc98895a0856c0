//! The gomote RPC service.
//!
//! Holds every collaborator the gomote methods work with and publishes the
//! method table the interceptor chain needs. Method bodies belong to the
//! remote-execution layer; until one is wired in, calls that pass
//! authentication are answered with `UNIMPLEMENTED`.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use gomote_core::CallKind;
use gomote_core::auth::CallerIdentity;
use gomote_core::remote::{Scheduler, SessionPool};
use gomote_core::shell::CertificateAuthority;
use http::{Request, Response};

use crate::clients::{ConfigClient, StorageClient};
use crate::rpc::{RpcHandler, status_response};

/// Fully qualified service name.
pub const SERVICE_NAME: &str = "protos.GomoteService";

/// Methods of the gomote service and their call kinds.
pub const METHODS: &[(&str, CallKind)] = &[
    ("Authenticate", CallKind::Unary),
    ("AddBootstrap", CallKind::Unary),
    ("CreateInstance", CallKind::Streaming),
    ("InstanceAlive", CallKind::Unary),
    ("ExecuteCommand", CallKind::Streaming),
    ("ListDirectory", CallKind::Unary),
    ("ListDirectoryStreaming", CallKind::Streaming),
    ("ListInstances", CallKind::Unary),
    ("ListSwarmingBuilders", CallKind::Unary),
    ("DestroyInstance", CallKind::Unary),
    ("ReadTGZToURL", CallKind::Unary),
    ("RemoveFiles", CallKind::Unary),
    ("SignSSHKey", CallKind::Unary),
    ("UploadFile", CallKind::Unary),
    ("WriteFileFromURL", CallKind::Unary),
    ("WriteTGZFromURL", CallKind::Unary),
];

/// The gomote service and its collaborators.
pub struct GomoteService {
    pool: Arc<SessionPool>,
    scheduler: Arc<Scheduler>,
    ca: Arc<CertificateAuthority>,
    bucket: String,
    storage: StorageClient,
    config: ConfigClient,
}

impl GomoteService {
    /// Service over the given collaborators.
    #[must_use]
    pub fn new(
        pool: Arc<SessionPool>,
        scheduler: Arc<Scheduler>,
        ca: Arc<CertificateAuthority>,
        bucket: impl Into<String>,
        storage: StorageClient,
        config: ConfigClient,
    ) -> Self {
        Self {
            pool,
            scheduler,
            ca,
            bucket: bucket.into(),
            storage,
            config,
        }
    }

    fn method_name<'a>(&self, path: &'a str) -> Option<&'a str> {
        path.strip_prefix('/')?
            .strip_prefix(SERVICE_NAME)?
            .strip_prefix('/')
    }
}

impl fmt::Debug for GomoteService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GomoteService")
            .field("bucket", &self.bucket)
            .field("active_sessions", &self.pool.len())
            .field("scheduler", &self.scheduler)
            .field("ca", &self.ca)
            .field("storage", &self.storage)
            .field("config", &self.config)
            .finish()
    }
}

#[async_trait]
impl RpcHandler for GomoteService {
    fn call_kind(&self, method: &str) -> Option<CallKind> {
        let name = self.method_name(method)?;
        METHODS
            .iter()
            .find(|(m, _)| *m == name)
            .map(|(_, kind)| *kind)
    }

    async fn call(&self, request: Request<Body>) -> Response<Body> {
        let path = request.uri().path();
        let caller = request
            .extensions()
            .get::<CallerIdentity>()
            .map(|id| id.email.as_str())
            .unwrap_or("");

        let status = match self.call_kind(path) {
            Some(kind) => {
                tracing::info!(
                    method = %path,
                    ?kind,
                    caller,
                    active_sessions = self.pool.len(),
                    "gomote call"
                );
                tonic::Status::unimplemented(format!("method {path} is not implemented"))
            }
            None => tonic::Status::unimplemented(format!("unknown method {path}")),
        };
        status_response(&status)
    }
}
