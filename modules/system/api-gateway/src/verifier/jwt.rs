//! JWT verification against the identity provider's signing keys.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use mlops_security::Identity;
use secrecy::SecretString;

use super::TokenVerifier;
use super::claims::{Claims, identity_from_claims};
use super::jwks::JwksCache;
use crate::config::EntraIdConfig;
use crate::error::{AuthError, ConfigError};
use crate::session::SessionStore;

/// What a token must satisfy besides a valid signature.
#[derive(Debug, Clone)]
pub struct JwtValidationSettings {
    pub issuers: Vec<String>,
    pub audiences: Vec<String>,
    pub algorithms: Vec<Algorithm>,
    /// Tolerated clock skew for `exp` and `nbf`, in seconds.
    pub leeway_secs: u64,
}

impl JwtValidationSettings {
    /// # Errors
    /// `ConfigError::Fatal` when the configured algorithm list is invalid.
    pub fn from_config(entra: &EntraIdConfig, leeway_secs: u64) -> Result<Self, ConfigError> {
        Ok(Self {
            issuers: entra.issuers(),
            audiences: entra.audiences(),
            algorithms: entra.parsed_algorithms()?,
            leeway_secs,
        })
    }

    fn validation(&self, alg: Algorithm) -> Validation {
        let mut validation = Validation::new(alg);
        validation.set_audience(&self.audiences);
        validation.set_issuer(&self.issuers);
        validation.set_required_spec_claims(&["exp", "iss", "aud"]);
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.leeway = self.leeway_secs;
        validation
    }
}

/// Production [`TokenVerifier`]: signature, issuer, audience and lifetime checks,
/// then claim extraction. Every success refreshes the subject's session.
#[derive(Debug, Clone)]
pub struct JwtTokenVerifier {
    keys: Arc<JwksCache>,
    sessions: SessionStore,
    settings: JwtValidationSettings,
}

impl JwtTokenVerifier {
    #[must_use]
    pub fn new(
        keys: Arc<JwksCache>,
        sessions: SessionStore,
        settings: JwtValidationSettings,
    ) -> Self {
        Self {
            keys,
            sessions,
            settings,
        }
    }

    #[must_use]
    pub fn keys(&self) -> &Arc<JwksCache> {
        &self.keys
    }

    fn validate(&self, token: &str, key: &DecodingKey, alg: Algorithm) -> Result<Claims, AuthError> {
        decode::<Claims>(token, key, &self.settings.validation(alg))
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::malformed(e.to_string()),
            })
    }
}

#[async_trait]
impl TokenVerifier for JwtTokenVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::Missing);
        }

        let header =
            decode_header(token).map_err(|e| AuthError::malformed(format!("bad header: {e}")))?;
        if !self.settings.algorithms.contains(&header.alg) {
            tracing::debug!(alg = ?header.alg, "Token algorithm not accepted");
            return Err(AuthError::malformed("token algorithm not accepted"));
        }
        let kid = header
            .kid
            .as_deref()
            .ok_or_else(|| AuthError::malformed("token header has no kid"))?;

        let key = self.keys.key_for(kid).await?;
        if key.algorithm.is_some_and(|pinned| pinned != header.alg) {
            return Err(AuthError::malformed(format!(
                "key '{kid}' is pinned to a different algorithm"
            )));
        }

        let claims = self.validate(token, &key.key, header.alg)?;
        let identity = identity_from_claims(&claims)?.with_bearer_token(token.to_owned());

        self.sessions.upsert(
            identity.subject_id(),
            SecretString::from(token.to_owned()),
            Utc::now(),
        );
        tracing::debug!(subject_id = %identity.subject_id(), kid = %kid, "Token verified");
        Ok(identity)
    }
}
