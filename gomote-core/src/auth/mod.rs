//! RPC authentication policy.
//!
//! The policy is a pair of interceptor chains, one for unary calls and one for
//! streaming calls, chosen once from the deployment context. Under a managed
//! deployment both chains hold an identity-aware-proxy check; everywhere else
//! they are empty and calls pass through unauthenticated.
//!
//! Interceptors work on the request head only. They may reject the call with a
//! gRPC status or attach data (such as the caller identity) to the request
//! extensions for the service to read.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use http::request::Parts;

use crate::environment::{DeploymentContext, EnvConfig, EnvironmentError, IAP_BACKEND};

pub mod iap;
pub mod jwks;

pub use iap::{
    AssertionVerifier, AudienceValidation, CallerIdentity, IAP_ASSERTION_HEADER, IapInterceptor,
    VerifyError,
};
pub use jwks::JwksVerifier;

/// Shape of an RPC method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// Single request, single response.
    Unary,
    /// Client, server or bidirectional streaming.
    Streaming,
}

/// A check run against the request head before an RPC reaches the service.
#[async_trait]
pub trait CallInterceptor: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Accept the call (optionally annotating `parts`) or reject it.
    async fn intercept(&self, parts: &mut Parts) -> Result<(), tonic::Status>;
}

/// Interceptor chains attached to the RPC server.
#[derive(Clone, Default)]
pub struct AuthPolicy {
    unary: Vec<Arc<dyn CallInterceptor>>,
    streaming: Vec<Arc<dyn CallInterceptor>>,
}

impl AuthPolicy {
    /// Policy with no interceptors.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Policy with explicit chains.
    #[must_use]
    pub fn new(
        unary: Vec<Arc<dyn CallInterceptor>>,
        streaming: Vec<Arc<dyn CallInterceptor>>,
    ) -> Self {
        Self { unary, streaming }
    }

    /// Choose the policy for a resolved deployment.
    ///
    /// A managed deployment always gets interceptors; one without a backend
    /// service id is refused rather than left unauthenticated.
    pub fn select(
        context: DeploymentContext,
        env: &EnvConfig,
        verifier: Arc<dyn AssertionVerifier>,
    ) -> Result<Self, EnvironmentError> {
        if !context.is_managed() {
            tracing::info!(%context, "RPC authentication disabled");
            return Ok(Self::none());
        }

        let service_id = env.backend_service_id.clone().ok_or_else(|| {
            EnvironmentError::MissingBackendServiceId {
                env: env.name.clone(),
                backend: IAP_BACKEND,
            }
        })?;

        tracing::info!(
            backend_service_id = %service_id,
            "RPC calls require an IAP assertion (audience validation skipped)"
        );
        let interceptor: Arc<dyn CallInterceptor> = Arc::new(IapInterceptor::new(
            service_id,
            AudienceValidation::Skip,
            verifier,
        ));
        Ok(Self::new(vec![interceptor.clone()], vec![interceptor]))
    }

    /// True when no call is ever intercepted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.unary.is_empty() && self.streaming.is_empty()
    }

    /// Interceptors applied to calls of `kind`.
    #[must_use]
    pub fn interceptors(&self, kind: CallKind) -> &[Arc<dyn CallInterceptor>] {
        match kind {
            CallKind::Unary => &self.unary,
            CallKind::Streaming => &self.streaming,
        }
    }

    /// Run the chain for `kind`, stopping at the first rejection.
    pub async fn authorize(&self, kind: CallKind, parts: &mut Parts) -> Result<(), tonic::Status> {
        for interceptor in self.interceptors(kind) {
            if let Err(status) = interceptor.intercept(parts).await {
                tracing::debug!(
                    interceptor = interceptor.name(),
                    path = %parts.uri.path(),
                    code = ?status.code(),
                    "RPC call rejected"
                );
                return Err(status);
            }
        }
        Ok(())
    }
}

impl fmt::Debug for AuthPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = |chain: &[Arc<dyn CallInterceptor>]| {
            chain.iter().map(|i| i.name()).collect::<Vec<_>>()
        };
        f.debug_struct("AuthPolicy")
            .field("unary", &names(&self.unary))
            .field("streaming", &names(&self.streaming))
            .finish()
    }
}
