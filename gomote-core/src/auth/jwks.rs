//! IAP assertion verification against the published JWK set.

use async_trait::async_trait;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde::Deserialize;
use tokio::sync::RwLock;

use super::iap::{AssertionVerifier, AudienceValidation, CallerIdentity, IAP_ISSUER, VerifyError};

/// Where IAP publishes its signing keys.
pub const IAP_JWKS_URL: &str = "https://www.gstatic.com/iap/verify/public_key-jwk";

#[derive(Debug, Deserialize)]
struct IapClaims {
    #[serde(default)]
    email: String,
    #[serde(default)]
    sub: String,
}

/// ES256 verifier with a cached key set.
///
/// Keys are fetched lazily and refetched once when an assertion names a key
/// id that is not cached, which covers key rotation.
pub struct JwksVerifier {
    http: reqwest::Client,
    url: String,
    keys: RwLock<Option<JwkSet>>,
}

impl JwksVerifier {
    /// Verifier fetching keys from the public IAP endpoint.
    #[must_use]
    pub fn new() -> Self {
        Self::with_url(IAP_JWKS_URL)
    }

    /// Verifier fetching keys from `url`.
    #[must_use]
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into(),
            keys: RwLock::new(None),
        }
    }

    /// Verifier with a fixed key set that is never refetched.
    #[must_use]
    pub fn with_keys(keys: JwkSet) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: String::new(),
            keys: RwLock::new(Some(keys)),
        }
    }

    async fn decoding_key(&self, kid: &str) -> Result<DecodingKey, VerifyError> {
        if let Some(set) = self.keys.read().await.as_ref()
            && let Some(jwk) = set.find(kid)
        {
            return Ok(DecodingKey::from_jwk(jwk)?);
        }

        if self.url.is_empty() {
            return Err(VerifyError::UnknownKey(kid.to_string()));
        }

        let set = self.fetch().await?;
        let key = set
            .find(kid)
            .map(DecodingKey::from_jwk)
            .transpose()?
            .ok_or_else(|| VerifyError::UnknownKey(kid.to_string()))?;
        *self.keys.write().await = Some(set);
        Ok(key)
    }

    async fn fetch(&self) -> Result<JwkSet, VerifyError> {
        tracing::debug!(url = %self.url, "Fetching IAP verification keys");
        self.http
            .get(&self.url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(VerifyError::KeyFetch)?
            .json::<JwkSet>()
            .await
            .map_err(VerifyError::KeyFetch)
    }
}

impl Default for JwksVerifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AssertionVerifier for JwksVerifier {
    async fn verify(
        &self,
        assertion: &str,
        audience: &AudienceValidation,
    ) -> Result<CallerIdentity, VerifyError> {
        let header = decode_header(assertion)?;
        let kid = header.kid.ok_or(VerifyError::MissingKeyId)?;
        let key = self.decoding_key(&kid).await?;

        let mut validation = Validation::new(Algorithm::ES256);
        validation.set_issuer(&[IAP_ISSUER]);
        match audience {
            AudienceValidation::Skip => validation.validate_aud = false,
            AudienceValidation::Require(aud) => validation.set_audience(&[aud]),
        }

        let claims = decode::<IapClaims>(assertion, &key, &validation)?.claims;
        if claims.email.is_empty() {
            return Err(VerifyError::MissingIdentity);
        }
        Ok(CallerIdentity {
            email: claims.email,
            subject: claims.sub,
        })
    }
}
