//! Bearer-token verification.

pub mod claims;
pub mod jwks;
pub mod jwt;

use async_trait::async_trait;
use mlops_security::Identity;

use crate::error::AuthError;

pub use jwks::JwksCache;
pub use jwt::{JwtTokenVerifier, JwtValidationSettings};

/// Turns a presented bearer token into a verified [`Identity`].
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Verify `token` and return the caller's identity.
    ///
    /// # Errors
    /// Any [`AuthError`]; callers map every variant to a uniform 401.
    async fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}
