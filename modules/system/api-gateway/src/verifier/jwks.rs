//! Signing-key set cache.
//!
//! Keys are fetched from the identity provider's discovery endpoint and kept
//! behind an `ArcSwap`, so the warm path is a lock-free load. Refreshes are
//! serialized by a mutex; a request arriving while another one refreshes waits
//! and then reuses that result instead of fetching again. Fetches are spaced
//! at least `min_refresh_interval` apart, whether the last one succeeded or not.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bytes::Bytes;
use http::{Method, Request, header};
use http_body_util::Full;
use jsonwebtoken::{Algorithm, DecodingKey};
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::error::AuthError;
use crate::http_client::{self, HttpsClient};

/// A JSON Web Key as published by the identity provider.
#[derive(Debug, Clone, Deserialize)]
pub struct Jwk {
    pub kty: String,
    #[serde(default)]
    pub kid: Option<String>,
    #[serde(default)]
    pub alg: Option<String>,
    #[serde(default, rename = "use")]
    pub use_: Option<String>,
    // RSA
    #[serde(default)]
    pub n: Option<String>,
    #[serde(default)]
    pub e: Option<String>,
    // EC
    #[serde(default)]
    pub x: Option<String>,
    #[serde(default)]
    pub y: Option<String>,
    // Octet sequence
    #[serde(default)]
    pub k: Option<String>,
}

impl Jwk {
    #[must_use]
    pub fn is_signing_key(&self) -> bool {
        self.use_.as_deref() != Some("enc")
    }

    fn decoding_key(&self) -> Result<DecodingKey, String> {
        match self.kty.as_str() {
            "RSA" => match (&self.n, &self.e) {
                (Some(n), Some(e)) => {
                    DecodingKey::from_rsa_components(n, e).map_err(|e| e.to_string())
                }
                _ => Err("RSA key without n/e".to_owned()),
            },
            "EC" => match (&self.x, &self.y) {
                (Some(x), Some(y)) => {
                    DecodingKey::from_ec_components(x, y).map_err(|e| e.to_string())
                }
                _ => Err("EC key without x/y".to_owned()),
            },
            "oct" => {
                let k = self.k.as_deref().ok_or("oct key without k")?;
                let secret = URL_SAFE_NO_PAD
                    .decode(k.trim_end_matches('='))
                    .map_err(|e| e.to_string())?;
                Ok(DecodingKey::from_secret(&secret))
            }
            other => Err(format!("unsupported key type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwkSet {
    pub keys: Vec<Jwk>,
}

/// A usable verification key.
#[derive(Clone)]
pub struct VerificationKey {
    pub key: DecodingKey,
    /// Algorithm pinned by the key set, if any.
    pub algorithm: Option<Algorithm>,
}

struct KeySet {
    by_kid: HashMap<String, Arc<VerificationKey>>,
    fetched_at: Instant,
}

impl KeySet {
    fn from_jwks(jwks: JwkSet) -> Self {
        let mut by_kid = HashMap::new();
        for jwk in jwks.keys {
            let Some(kid) = jwk.kid.clone() else {
                tracing::debug!(kty = %jwk.kty, "Skipping key without kid");
                continue;
            };
            if !jwk.is_signing_key() {
                tracing::debug!(kid = %kid, "Skipping encryption key");
                continue;
            }
            let algorithm = match jwk.alg.as_deref().map(Algorithm::from_str).transpose() {
                Ok(alg) => alg,
                Err(e) => {
                    tracing::warn!(kid = %kid, "Skipping key with unknown alg: {e}");
                    continue;
                }
            };
            match jwk.decoding_key() {
                Ok(key) => {
                    by_kid.insert(kid, Arc::new(VerificationKey { key, algorithm }));
                }
                Err(reason) => tracing::warn!(kid = %kid, "Skipping unusable key: {reason}"),
            }
        }
        Self {
            by_kid,
            fetched_at: Instant::now(),
        }
    }
}

/// Default spacing between two key-set fetches.
pub const DEFAULT_MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

pub struct JwksCache {
    jwks_uri: String,
    client: HttpsClient,
    fetch_timeout: Duration,
    refresh_interval: Duration,
    min_refresh_interval: Duration,
    keys: ArcSwapOption<KeySet>,
    /// Held while fetching; records when the last fetch was attempted.
    last_attempt: Mutex<Option<Instant>>,
}

impl fmt::Debug for JwksCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwksCache")
            .field("jwks_uri", &self.jwks_uri)
            .field("fetch_timeout", &self.fetch_timeout)
            .field("refresh_interval", &self.refresh_interval)
            .field("min_refresh_interval", &self.min_refresh_interval)
            .field("cached_keys", &self.cached_key_count())
            .finish_non_exhaustive()
    }
}

impl JwksCache {
    #[must_use]
    pub fn new(
        jwks_uri: impl Into<String>,
        client: HttpsClient,
        fetch_timeout: Duration,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            jwks_uri: jwks_uri.into(),
            client,
            fetch_timeout,
            refresh_interval,
            min_refresh_interval: DEFAULT_MIN_REFRESH_INTERVAL,
            keys: ArcSwapOption::empty(),
            last_attempt: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_min_refresh_interval(mut self, interval: Duration) -> Self {
        self.min_refresh_interval = interval;
        self
    }

    #[must_use]
    pub fn jwks_uri(&self) -> &str {
        &self.jwks_uri
    }

    #[must_use]
    pub fn cached_key_count(&self) -> usize {
        self.keys.load().as_ref().map_or(0, |set| set.by_kid.len())
    }

    /// Fetch the key set unconditionally. Used once at startup, where failure is fatal.
    ///
    /// # Errors
    /// `KeySourceUnavailable` when the endpoint cannot be reached or returns no usable key.
    pub async fn prefetch(&self) -> Result<usize, AuthError> {
        let mut last_attempt = self.last_attempt.lock().await;
        *last_attempt = Some(Instant::now());
        let set = self.fetch().await.map_err(AuthError::KeySourceUnavailable)?;
        if set.by_kid.is_empty() {
            return Err(AuthError::KeySourceUnavailable(format!(
                "{} published no usable signing keys",
                self.jwks_uri
            )));
        }
        let count = set.by_kid.len();
        self.keys.store(Some(Arc::new(set)));
        tracing::info!(jwks_uri = %self.jwks_uri, keys = count, "Signing keys loaded");
        Ok(count)
    }

    /// Resolve the key for `kid`.
    ///
    /// A stale set is refreshed first. An unknown `kid` forces at most one
    /// refresh, which picks up rotated keys, unless a fetch already happened
    /// within the minimum refresh interval.
    ///
    /// # Errors
    /// `Malformed` for a `kid` that is still unknown after refreshing,
    /// `KeySourceUnavailable` when no key set has ever been obtained.
    pub async fn key_for(&self, kid: &str) -> Result<Arc<VerificationKey>, AuthError> {
        let mut current = self.keys.load_full();
        let mut refreshed = false;

        let stale = current
            .as_ref()
            .is_none_or(|set| set.fetched_at.elapsed() >= self.refresh_interval);
        if stale {
            current = Some(self.refresh(current).await?);
            refreshed = true;
        }

        if let Some(key) = current.as_ref().and_then(|set| set.by_kid.get(kid)) {
            return Ok(Arc::clone(key));
        }

        if !refreshed {
            tracing::debug!(kid = %kid, "Unknown key id; refreshing signing keys");
            current = Some(self.refresh(current).await?);
        }

        current
            .as_ref()
            .and_then(|set| set.by_kid.get(kid))
            .map(Arc::clone)
            .ok_or_else(|| AuthError::malformed(format!("unknown key id '{kid}'")))
    }

    /// Replace the cached set. `seen` is the set the caller observed; if another
    /// task swapped in a newer one while we waited for the lock, that one is used.
    /// Inside the minimum refresh interval the cached set is returned unchanged.
    async fn refresh(&self, seen: Option<Arc<KeySet>>) -> Result<Arc<KeySet>, AuthError> {
        let mut last_attempt = self.last_attempt.lock().await;

        let latest = self.keys.load_full();
        if let Some(latest) = &latest {
            let replaced = seen
                .as_ref()
                .is_none_or(|seen| !Arc::ptr_eq(seen, latest));
            if replaced {
                return Ok(Arc::clone(latest));
            }
        }

        if let Some(at) = *last_attempt
            && at.elapsed() < self.min_refresh_interval
        {
            tracing::debug!(jwks_uri = %self.jwks_uri, "Key-set fetch suppressed; last attempt too recent");
            return latest.ok_or_else(|| {
                AuthError::KeySourceUnavailable(format!(
                    "{}: no signing keys and last fetch attempt was too recent",
                    self.jwks_uri
                ))
            });
        }
        *last_attempt = Some(Instant::now());

        match self.fetch().await {
            Ok(set) => {
                let set = Arc::new(set);
                tracing::debug!(jwks_uri = %self.jwks_uri, keys = set.by_kid.len(), "Signing keys refreshed");
                self.keys.store(Some(Arc::clone(&set)));
                Ok(set)
            }
            Err(reason) => match latest {
                Some(cached) => {
                    tracing::warn!(
                        jwks_uri = %self.jwks_uri,
                        "Signing-key refresh failed, keeping cached keys: {reason}"
                    );
                    Ok(cached)
                }
                None => Err(AuthError::KeySourceUnavailable(reason)),
            },
        }
    }

    async fn fetch(&self) -> Result<KeySet, String> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(&self.jwks_uri)
            .header(header::ACCEPT, "application/json")
            .body(Full::new(Bytes::new()))
            .map_err(|e| format!("invalid key-set URL '{}': {e}", self.jwks_uri))?;

        let response = http_client::send(
            &self.client,
            request,
            self.fetch_timeout,
            http_client::IDENTITY_PROVIDER_BODY_LIMIT,
        )
            .await
            .map_err(|e| format!("{}: {e}", self.jwks_uri))?;

        if !response.status().is_success() {
            return Err(format!(
                "{} responded with status {}",
                self.jwks_uri,
                response.status()
            ));
        }

        let jwks: JwkSet = serde_json::from_slice(response.body())
            .map_err(|e| format!("{}: invalid key set: {e}", self.jwks_uri))?;
        Ok(KeySet::from_jwks(jwks))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn jwk(value: serde_json::Value) -> Jwk {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn encryption_keys_are_skipped() {
        let set = KeySet::from_jwks(JwkSet {
            keys: vec![
                jwk(serde_json::json!({"kty": "oct", "kid": "sig", "k": "c2VjcmV0"})),
                jwk(serde_json::json!({"kty": "oct", "kid": "enc", "use": "enc", "k": "c2VjcmV0"})),
            ],
        });
        assert!(set.by_kid.contains_key("sig"));
        assert!(!set.by_kid.contains_key("enc"));
    }

    #[test]
    fn keys_without_kid_or_material_are_skipped() {
        let set = KeySet::from_jwks(JwkSet {
            keys: vec![
                jwk(serde_json::json!({"kty": "oct", "k": "c2VjcmV0"})),
                jwk(serde_json::json!({"kty": "RSA", "kid": "no-modulus", "e": "AQAB"})),
                jwk(serde_json::json!({"kty": "OKP", "kid": "unsupported"})),
            ],
        });
        assert!(set.by_kid.is_empty());
    }

    #[test]
    fn pinned_algorithm_is_recorded() {
        let set = KeySet::from_jwks(JwkSet {
            keys: vec![jwk(
                serde_json::json!({"kty": "oct", "kid": "k1", "alg": "HS256", "k": "c2VjcmV0"}),
            )],
        });
        assert_eq!(set.by_kid["k1"].algorithm, Some(Algorithm::HS256));
    }
}
