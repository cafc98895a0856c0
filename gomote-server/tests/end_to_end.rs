//! Boots a dev-mode server on ephemeral ports and talks to both sides of the
//! primary listener.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use gomote_core::auth::{AssertionVerifier, AudienceValidation, CallerIdentity, VerifyError};
use gomote_core::environment::{MetadataClient, MetadataError};
use gomote_core::secret::SecretValue;
use gomote_core::shell::ShellStatus;
use gomote_core::{CallKind, ServerSettings};
use gomote_server::bootstrap::{Bootstrap, Collaborators};
use gomote_server::error::BootstrapError;
use gomote_server::rpc::{RpcHandler, status_response};
use gomote_server::status::STATUS_BODY;
use http::{Request, Response};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

struct OffSubstrate;

#[async_trait]
impl MetadataClient for OffSubstrate {
    async fn on_substrate(&self) -> bool {
        false
    }
    async fn project_id(&self) -> Result<String, MetadataError> {
        panic!("dev mode must not ask for the project id");
    }
    async fn access_token(&self) -> Result<SecretValue, MetadataError> {
        panic!("dev mode must not ask for a token");
    }
}

struct RejectAll;

#[async_trait]
impl AssertionVerifier for RejectAll {
    async fn verify(
        &self,
        _assertion: &str,
        _audience: &AudienceValidation,
    ) -> Result<CallerIdentity, VerifyError> {
        Err(VerifyError::MissingKeyId)
    }
}

/// Records each call's path and whether an identity was attached.
#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<(String, bool)>>,
}

#[async_trait]
impl RpcHandler for Recorder {
    fn call_kind(&self, _method: &str) -> Option<CallKind> {
        Some(CallKind::Unary)
    }

    async fn call(&self, request: Request<Body>) -> Response<Body> {
        let has_identity = request.extensions().get::<CallerIdentity>().is_some();
        self.calls
            .lock()
            .unwrap()
            .push((request.uri().path().to_string(), has_identity));
        status_response(&tonic::Status::ok(""))
    }
}

#[tokio::test]
async fn test_dev_server_serves_rpc_and_status_on_one_port() {
    let recorder = Arc::new(Recorder::default());
    let collaborators = Collaborators::new(Arc::new(OffSubstrate), Arc::new(RejectAll))
        .with_rpc_handler(recorder.clone());
    let shutdown = CancellationToken::new();

    let server = Bootstrap::new(
        ServerSettings::local_dev("127.0.0.1:0", "127.0.0.1:0"),
        collaborators,
        shutdown.clone(),
    )
    .prepare()
    .await
    .unwrap();

    let shell_status = server
        .shell()
        .expect("dev mode starts the shell")
        .ready(Duration::from_secs(5))
        .await;
    assert!(matches!(shell_status, ShellStatus::Running { .. }), "{shell_status}");

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(server.serve_on(listener));

    // gRPC over cleartext HTTP/2.
    let h2 = reqwest::Client::builder()
        .http2_prior_knowledge()
        .build()
        .unwrap();
    let response = h2
        .post(format!("http://{addr}/protos.GomoteService/ListInstances"))
        .header("content-type", "application/grpc+proto")
        .header("te", "trailers")
        .body(vec![0u8, 0, 0, 0, 0])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["grpc-status"], "0");
    assert_eq!(
        recorder.calls.lock().unwrap().as_slice(),
        &[("/protos.GomoteService/ListInstances".to_string(), false)]
    );

    // Status page over HTTP/1.1.
    let h1 = reqwest::Client::builder().http1_only().build().unwrap();
    let page = h1.get(format!("http://{addr}/")).send().await.unwrap();
    assert_eq!(page.status(), 200);
    assert_eq!(page.headers()["content-type"], "text/plain");
    assert_eq!(page.text().await.unwrap(), STATUS_BODY);

    let missing = h1.get(format!("http://{addr}/x")).send().await.unwrap();
    assert_eq!(missing.status(), 404);

    // HTTP/2 without a gRPC content type is plain HTTP.
    let h2_page = h2.get(format!("http://{addr}/")).send().await.unwrap();
    assert_eq!(h2_page.text().await.unwrap(), STATUS_BODY);
    assert_eq!(recorder.calls.lock().unwrap().len(), 1);

    shutdown.cancel();
    let err = tokio::time::timeout(Duration::from_secs(10), task)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(err, BootstrapError::ListenerStopped { .. }));
}
