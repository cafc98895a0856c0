//! Protocol multiplexer for the primary listener.
//!
//! One port carries both gRPC and plain HTTP. Each request is classified on
//! its own from two observable fields, the HTTP version and the
//! `Content-Type` header, and handed to the matching inner service. Nothing
//! is cached between requests and classification cannot fail.

use std::convert::Infallible;
use std::task::{Context, Poll};

use axum::body::Body;
use futures_util::future::Either;
use http::{HeaderValue, Request, Response, Version, header};
use tower::ServiceExt;
use tower::util::Oneshot;

/// Content-type prefix marking gRPC requests.
pub const GRPC_CONTENT_TYPE_PREFIX: &str = "application/grpc";

/// Where a request goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    /// The gRPC server.
    Rpc,
    /// The status handler.
    Fallback,
}

impl RouteDecision {
    /// Classify from the two fields that matter.
    ///
    /// A missing or non-UTF-8 content type routes to the fallback.
    #[must_use]
    pub fn classify(version: Version, content_type: Option<&HeaderValue>) -> Self {
        let is_grpc = version == Version::HTTP_2
            && content_type
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.starts_with(GRPC_CONTENT_TYPE_PREFIX));
        if is_grpc { Self::Rpc } else { Self::Fallback }
    }

    /// Classify a request.
    #[must_use]
    pub fn for_request<B>(request: &Request<B>) -> Self {
        Self::classify(request.version(), request.headers().get(header::CONTENT_TYPE))
    }
}

/// Routes each request to `rpc` or `fallback`.
#[derive(Debug, Clone)]
pub struct Multiplexer<R, F> {
    rpc: R,
    fallback: F,
}

impl<R, F> Multiplexer<R, F> {
    /// Multiplexer in front of the two services.
    pub fn new(rpc: R, fallback: F) -> Self {
        Self { rpc, fallback }
    }

    /// The gRPC side.
    pub fn rpc(&self) -> &R {
        &self.rpc
    }
}

impl<R, F> tower::Service<Request<Body>> for Multiplexer<R, F>
where
    R: tower::Service<Request<Body>, Response = Response<Body>, Error = Infallible> + Clone,
    F: tower::Service<Request<Body>, Response = Response<Body>, Error = Infallible> + Clone,
{
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = Either<Oneshot<R, Request<Body>>, Oneshot<F, Request<Body>>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Readiness is checked per request by `oneshot` on a clone.
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        match RouteDecision::for_request(&request) {
            RouteDecision::Rpc => Either::Left(self.rpc.clone().oneshot(request)),
            RouteDecision::Fallback => Either::Right(self.fallback.clone().oneshot(request)),
        }
    }
}
