//! gRPC side of the primary listener.
//!
//! [`RpcServer`] is the piece the multiplexer hands gRPC requests to. It looks
//! up the method's call kind, runs the matching interceptor chain from the
//! [`AuthPolicy`], and only then passes the request to the registered
//! [`RpcHandler`]. Rejections become trailers-only gRPC responses.

use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use axum::body::Body;
use futures_util::future::BoxFuture;
use gomote_core::{AuthPolicy, CallKind};
use http::{HeaderValue, Request, Response, StatusCode, header};
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};

/// Content type of gRPC responses.
pub const GRPC_CONTENT_TYPE: &str = "application/grpc";

/// Bytes escaped in `grpc-message`: controls, non-ASCII and `%` itself.
const GRPC_MESSAGE: &AsciiSet = &CONTROLS.add(b'%');

/// A gRPC service behind the interceptor chain.
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    /// Call kind of a method path such as `/pkg.Service/Method`, or `None`
    /// when the handler does not know the method.
    fn call_kind(&self, method: &str) -> Option<CallKind>;

    /// Serve an authorised call.
    async fn call(&self, request: Request<Body>) -> Response<Body>;
}

/// Handler answering every call with `UNIMPLEMENTED`.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnimplementedHandler;

#[async_trait]
impl RpcHandler for UnimplementedHandler {
    fn call_kind(&self, _method: &str) -> Option<CallKind> {
        None
    }

    async fn call(&self, request: Request<Body>) -> Response<Body> {
        status_response(&tonic::Status::unimplemented(format!(
            "unknown method {}",
            request.uri().path()
        )))
    }
}

/// Interceptor-guarded gRPC server.
#[derive(Clone)]
pub struct RpcServer {
    handler: Arc<dyn RpcHandler>,
    policy: Arc<AuthPolicy>,
}

impl RpcServer {
    /// Server with `policy` attached and no service registered yet.
    #[must_use]
    pub fn new(policy: AuthPolicy) -> Self {
        Self {
            handler: Arc::new(UnimplementedHandler),
            policy: Arc::new(policy),
        }
    }

    /// Register the service that receives authorised calls.
    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn RpcHandler>) -> Self {
        self.handler = handler;
        self
    }

    /// The attached policy.
    #[must_use]
    pub fn policy(&self) -> &AuthPolicy {
        &self.policy
    }

    async fn dispatch(self, request: Request<Body>) -> Response<Body> {
        let (mut parts, body) = request.into_parts();
        // Unknown methods take the streaming path, like any gRPC server's
        // unknown-service handler.
        let kind = self
            .handler
            .call_kind(parts.uri.path())
            .unwrap_or(CallKind::Streaming);

        if let Err(status) = self.policy.authorize(kind, &mut parts).await {
            return status_response(&status);
        }
        self.handler.call(Request::from_parts(parts, body)).await
    }
}

impl tower::Service<Request<Body>> for RpcServer {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let this = self.clone();
        Box::pin(async move { Ok(this.dispatch(request).await) })
    }
}

/// Trailers-only gRPC response carrying `status`.
pub fn status_response(status: &tonic::Status) -> Response<Body> {
    let code = status.code() as i32;
    let message = utf8_percent_encode(status.message(), GRPC_MESSAGE).to_string();

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(GRPC_CONTENT_TYPE),
    );
    headers.insert("grpc-status", HeaderValue::from(code));
    if let Ok(value) = HeaderValue::from_str(&message) {
        headers.insert("grpc-message", value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gomote_core::auth::{CallInterceptor, CallerIdentity};
    use http::request::Parts;
    use std::sync::Mutex;
    use tower::ServiceExt;

    /// Records the caller identity each call arrived with.
    struct Recorder(Mutex<Vec<Option<String>>>);

    #[async_trait]
    impl RpcHandler for Recorder {
        fn call_kind(&self, method: &str) -> Option<CallKind> {
            (method == "/test.Svc/Unary").then_some(CallKind::Unary)
        }

        async fn call(&self, request: Request<Body>) -> Response<Body> {
            let email = request
                .extensions()
                .get::<CallerIdentity>()
                .map(|id| id.email.clone());
            self.0.lock().unwrap().push(email);
            status_response(&tonic::Status::ok(""))
        }
    }

    /// Accepts calls carrying `x-ok`, tagging them with an identity.
    struct HeaderGate;

    #[async_trait]
    impl CallInterceptor for HeaderGate {
        fn name(&self) -> &'static str {
            "header-gate"
        }

        async fn intercept(&self, parts: &mut Parts) -> Result<(), tonic::Status> {
            if parts.headers.contains_key("x-ok") {
                parts.extensions.insert(CallerIdentity {
                    email: "gopher@example.com".to_string(),
                    subject: "1".to_string(),
                });
                Ok(())
            } else {
                Err(tonic::Status::unauthenticated("no assertion: 100%"))
            }
        }
    }

    fn request(path: &str, ok: bool) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(path)
            .header(header::CONTENT_TYPE, "application/grpc");
        if ok {
            builder = builder.header("x-ok", "1");
        }
        builder.body(Body::empty()).unwrap()
    }

    fn grpc_status(response: &Response<Body>) -> &str {
        response.headers()["grpc-status"].to_str().unwrap()
    }

    #[test]
    fn test_status_response_encoding() {
        let response = status_response(&tonic::Status::unauthenticated("bad\nassertion 100%"));
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(grpc_status(&response), "16");
        assert_eq!(
            response.headers()["grpc-message"],
            "bad%0Aassertion 100%25"
        );
        assert_eq!(response.headers()[header::CONTENT_TYPE], GRPC_CONTENT_TYPE);
    }

    #[tokio::test]
    async fn test_empty_policy_passes_through() {
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let server = RpcServer::new(AuthPolicy::none()).with_handler(recorder.clone());

        let response = server.oneshot(request("/test.Svc/Unary", false)).await.unwrap();
        assert_eq!(grpc_status(&response), "0");
        assert_eq!(*recorder.0.lock().unwrap(), vec![None]);
    }

    #[tokio::test]
    async fn test_policy_rejects_and_annotates() {
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let gate: Arc<dyn CallInterceptor> = Arc::new(HeaderGate);
        let policy = AuthPolicy::new(vec![gate.clone()], vec![gate]);
        let server = RpcServer::new(policy).with_handler(recorder.clone());

        let rejected = server
            .clone()
            .oneshot(request("/test.Svc/Unary", false))
            .await
            .unwrap();
        assert_eq!(grpc_status(&rejected), "16");
        assert_eq!(rejected.headers()["grpc-message"], "no assertion: 100%25");

        // Unknown methods are still guarded (streaming chain).
        let rejected = server
            .clone()
            .oneshot(request("/test.Svc/Missing", false))
            .await
            .unwrap();
        assert_eq!(grpc_status(&rejected), "16");

        let accepted = server.oneshot(request("/test.Svc/Unary", true)).await.unwrap();
        assert_eq!(grpc_status(&accepted), "0");
        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec![Some("gopher@example.com".to_string())]
        );
    }

    #[tokio::test]
    async fn test_unimplemented_by_default() {
        let server = RpcServer::new(AuthPolicy::none());
        let response = server.oneshot(request("/test.Svc/Unary", false)).await.unwrap();
        assert_eq!(grpc_status(&response), "12");
    }
}
