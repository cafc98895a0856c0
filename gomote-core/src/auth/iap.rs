//! Identity-aware-proxy assertion check.

use std::sync::Arc;

use async_trait::async_trait;
use http::request::Parts;
use thiserror::Error;

use super::CallInterceptor;
use crate::environment::BackendServiceId;

/// Header carrying the signed IAP assertion.
pub const IAP_ASSERTION_HEADER: &str = "x-goog-iap-jwt-assertion";

/// Issuer of IAP assertions.
pub const IAP_ISSUER: &str = "https://cloud.google.com/iap";

/// How the assertion's audience claim is checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudienceValidation {
    /// Trust the proxy's own audience enforcement.
    Skip,
    /// Require this exact audience.
    Require(String),
}

/// Caller identity carried by a verified assertion.
///
/// Inserted into the request extensions of every authenticated call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    /// Authenticated email address.
    pub email: String,
    /// Stable subject id.
    pub subject: String,
}

/// Assertion verification failures.
#[derive(Debug, Error)]
pub enum VerifyError {
    /// The JWT header names no key.
    #[error("assertion header has no key id")]
    MissingKeyId,

    /// No published key matches the key id.
    #[error("no verification key with id '{0}'")]
    UnknownKey(String),

    /// The published key set could not be fetched.
    #[error("failed to fetch verification keys")]
    KeyFetch(#[source] reqwest::Error),

    /// Signature, expiry, issuer or audience check failed.
    #[error("invalid assertion")]
    Invalid(#[from] jsonwebtoken::errors::Error),

    /// The token verified but carries no usable identity.
    #[error("assertion carries no email claim")]
    MissingIdentity,
}

/// Verifies a raw assertion and extracts the caller identity.
#[async_trait]
pub trait AssertionVerifier: Send + Sync {
    /// Verify `assertion` and return who made the call.
    async fn verify(
        &self,
        assertion: &str,
        audience: &AudienceValidation,
    ) -> Result<CallerIdentity, VerifyError>;
}

/// Rejects calls lacking a valid IAP assertion.
pub struct IapInterceptor {
    backend_service_id: BackendServiceId,
    audience: AudienceValidation,
    verifier: Arc<dyn AssertionVerifier>,
}

impl IapInterceptor {
    /// Interceptor for the backend identified by `backend_service_id`.
    #[must_use]
    pub fn new(
        backend_service_id: BackendServiceId,
        audience: AudienceValidation,
        verifier: Arc<dyn AssertionVerifier>,
    ) -> Self {
        Self {
            backend_service_id,
            audience,
            verifier,
        }
    }

    /// Backend this interceptor guards.
    #[must_use]
    pub fn backend_service_id(&self) -> &BackendServiceId {
        &self.backend_service_id
    }
}

#[async_trait]
impl CallInterceptor for IapInterceptor {
    fn name(&self) -> &'static str {
        "iap"
    }

    async fn intercept(&self, parts: &mut Parts) -> Result<(), tonic::Status> {
        let Some(assertion) = parts
            .headers
            .get(IAP_ASSERTION_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
        else {
            return Err(tonic::Status::unauthenticated("missing IAP assertion"));
        };

        match self.verifier.verify(assertion, &self.audience).await {
            Ok(identity) => {
                tracing::debug!(
                    email = %identity.email,
                    backend_service_id = %self.backend_service_id,
                    "IAP assertion verified"
                );
                parts.extensions.insert(identity);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    backend_service_id = %self.backend_service_id,
                    "IAP assertion rejected"
                );
                Err(tonic::Status::unauthenticated("invalid IAP assertion"))
            }
        }
    }
}
