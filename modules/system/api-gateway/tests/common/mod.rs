#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use api_gateway::config::{FEAST_SERVICE, MLFLOW_SERVICE, SecurityConfig};
use api_gateway::http_client;
use api_gateway::{
    AuthError, GatewayConfig, JwksCache, JwtTokenVerifier, JwtValidationSettings, SessionStore,
    TokenVerifier,
};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::Response;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use http_body_util::BodyExt;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use mlops_security::Identity;
use serde_json::{Value, json};

pub const ISSUER: &str = "https://login.example.test/tenant-1/v2.0";
pub const AUDIENCE: &str = "api://gateway-tests";
pub const SIGNING_SECRET: &[u8] = b"integration-test-signing-secret-0123456789";

pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Symmetric JWK usable by the HS256 test tokens.
pub fn oct_jwk(kid: &str, secret: &[u8]) -> Value {
    json!({
        "kty": "oct",
        "kid": kid,
        "alg": "HS256",
        "use": "sig",
        "k": URL_SAFE_NO_PAD.encode(secret),
    })
}

pub fn jwks_body(keys: &[Value]) -> Value {
    json!({ "keys": keys })
}

/// Claims accepted by [`verifier_settings`], valid for an hour.
pub fn valid_claims(subject: &str) -> Value {
    let now = now_secs();
    json!({
        "oid": subject,
        "sub": format!("pairwise-{subject}"),
        "email": format!("{subject}@example.test"),
        "name": "Test User",
        "groups": ["data-science"],
        "roles": ["mlflow:read"],
        "iss": ISSUER,
        "aud": AUDIENCE,
        "iat": now,
        "nbf": now - 5,
        "exp": now + 3600,
    })
}

pub fn mint_token(kid: &str, secret: &[u8], claims: &Value) -> String {
    let mut header = Header::new(Algorithm::HS256);
    header.kid = Some(kid.to_owned());
    encode(&header, claims, &EncodingKey::from_secret(secret)).unwrap()
}

/// Test issuer and audience with the production security defaults.
pub fn verifier_settings() -> JwtValidationSettings {
    JwtValidationSettings {
        issuers: vec![ISSUER.to_owned()],
        audiences: vec![AUDIENCE.to_owned()],
        algorithms: vec![Algorithm::HS256],
        leeway_secs: SecurityConfig::default().leeway_secs,
    }
}

pub fn jwks_cache(jwks_uri: &str, min_refresh_interval: Duration) -> Arc<JwksCache> {
    Arc::new(
        JwksCache::new(
            jwks_uri,
            http_client::build_client().unwrap(),
            Duration::from_secs(2),
            Duration::from_secs(3600),
        )
        .with_min_refresh_interval(min_refresh_interval),
    )
}

/// Verifier with the production key-refresh spacing.
pub fn jwt_verifier(jwks_uri: &str, sessions: SessionStore) -> JwtTokenVerifier {
    let spacing = Duration::from_secs(SecurityConfig::default().key_min_refresh_interval_secs);
    JwtTokenVerifier::new(jwks_cache(jwks_uri, spacing), sessions, verifier_settings())
}

/// Verifier that may refetch keys immediately, for rotation scenarios.
pub fn eager_jwt_verifier(jwks_uri: &str, sessions: SessionStore) -> JwtTokenVerifier {
    JwtTokenVerifier::new(
        jwks_cache(jwks_uri, Duration::ZERO),
        sessions,
        verifier_settings(),
    )
}

pub fn session_store() -> SessionStore {
    SessionStore::new(Duration::from_secs(3600))
}

pub fn identity(subject: &str, roles: &[&str]) -> Identity {
    Identity::builder()
        .subject_id(subject)
        .email(format!("{subject}@example.test"))
        .display_name(format!("User {subject}"))
        .groups(["data-science"])
        .roles(roles.iter().copied())
        .bearer_token(format!("token-of-{subject}"))
        .build()
}

/// Verifier that maps fixed bearer tokens to identities and counts calls.
#[derive(Default)]
pub struct StubVerifier {
    identities: BTreeMap<String, Identity>,
    calls: AtomicUsize,
}

impl StubVerifier {
    pub fn with(mut self, token: &str, identity: Identity) -> Self {
        self.identities.insert(token.to_owned(), identity);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenVerifier for StubVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.identities
            .get(token)
            .cloned()
            .ok_or_else(|| AuthError::malformed("unknown test token"))
    }
}

/// Configuration with every upstream pointed at `upstream_base`.
pub fn gateway_config(upstream_base: &str) -> GatewayConfig {
    let mut cfg = GatewayConfig::default();
    cfg.entra_id.tenant_id = "tenant-1".to_owned();
    cfg.entra_id.client_id = "client-1".to_owned();
    cfg.entra_id.audience = AUDIENCE.to_owned();
    cfg.upstreams = BTreeMap::from([
        (MLFLOW_SERVICE.to_owned(), upstream_base.to_owned()),
        (FEAST_SERVICE.to_owned(), upstream_base.to_owned()),
    ]);
    cfg.proxy.timeout_secs = 2;
    cfg
}

pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

pub async fn body_text(response: Response<Body>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}
