use axum::http::{HeaderMap, Method, header};
use axum::response::IntoResponse;
use std::{collections::HashMap, sync::Arc};

use crate::error::AuthError;
use crate::verifier::TokenVerifier;

/// Routes served without a bearer token.
pub const PUBLIC_ROUTES: &[(Method, &str)] = &[
    (Method::GET, "/health"),
    (Method::GET, "/healthz"),
    (Method::GET, "/openapi.json"),
    (Method::GET, "/docs"),
    (Method::GET, "/oauth/authorize"),
    (Method::GET, "/oauth/callback"),
    (Method::POST, "/oauth/token"),
];

/// Route matcher for a specific HTTP method.
#[derive(Clone, Default)]
pub struct RouteMatcher {
    matcher: matchit::Router<()>,
}

impl RouteMatcher {
    fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, path: &str) -> Result<(), matchit::InsertError> {
        self.matcher.insert(path, ())
    }

    fn find(&self, path: &str) -> bool {
        self.matcher.at(path).is_ok()
    }
}

/// Whether a route requires authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthRequirement {
    /// No authentication required (public route).
    None,
    /// Authentication required.
    Required,
}

/// Public-path bypass check, the first pipeline stage. Anything not listed
/// as public requires authentication.
#[derive(Clone)]
pub struct GatewayRoutePolicy {
    public_matchers: Arc<HashMap<Method, RouteMatcher>>,
}

impl GatewayRoutePolicy {
    #[must_use]
    pub fn new(public_matchers: Arc<HashMap<Method, RouteMatcher>>) -> Self {
        Self { public_matchers }
    }

    /// Resolve the authentication requirement for a given (method, path).
    #[must_use]
    pub fn resolve(&self, method: &Method, path: &str) -> AuthRequirement {
        let is_public = self
            .public_matchers
            .get(method)
            .is_some_and(|matcher| matcher.find(path));

        if is_public {
            AuthRequirement::None
        } else {
            AuthRequirement::Required
        }
    }
}

fn build_matchers<'a>(
    routes: impl IntoIterator<Item = &'a (Method, &'a str)>,
) -> Result<HashMap<Method, RouteMatcher>, anyhow::Error> {
    let mut matchers: HashMap<Method, RouteMatcher> = HashMap::new();
    for (method, path) in routes {
        matchers
            .entry(method.clone())
            .or_insert_with(RouteMatcher::new)
            .insert(path)
            .map_err(|e| anyhow::anyhow!("Failed to insert route pattern '{path}': {e}"))?;
    }
    Ok(matchers)
}

/// Build the gateway's policy: every route needs a bearer token unless listed
/// in `public_routes`.
///
/// # Errors
/// Returns an error if a route pattern is rejected by the matcher.
pub fn build_route_policy(
    public_routes: &[(Method, &str)],
) -> Result<GatewayRoutePolicy, anyhow::Error> {
    Ok(GatewayRoutePolicy::new(Arc::new(build_matchers(public_routes)?)))
}

/// Shared state for the authentication middleware.
#[derive(Clone)]
pub struct AuthState {
    pub verifier: Arc<dyn TokenVerifier>,
    pub route_policy: GatewayRoutePolicy,
}

/// Authentication middleware backed by a [`TokenVerifier`].
///
/// For each request:
/// 1. Skips CORS preflight requests
/// 2. Resolves the route's auth requirement via `GatewayRoutePolicy`
/// 3. For public routes: passes through without touching the verifier
/// 4. For required routes: extracts the bearer token, verifies it, inserts the `Identity`
pub async fn authn_middleware(
    axum::extract::State(state): axum::extract::State<AuthState>,
    mut req: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    if is_preflight_request(req.method(), req.headers()) {
        return next.run(req).await;
    }

    match state.route_policy.resolve(req.method(), req.uri().path()) {
        AuthRequirement::None => next.run(req).await,
        AuthRequirement::Required => {
            let Some(token) = extract_bearer_token(req.headers()) else {
                return AuthError::Missing.into_response();
            };

            match state.verifier.verify(token).await {
                Ok(identity) => {
                    req.extensions_mut().insert(identity);
                    next.run(req).await
                }
                Err(err) => err.into_response(),
            }
        }
    }
}

/// Extract Bearer token from Authorization header
fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer ").map(str::trim))
        .filter(|t| !t.is_empty())
}

/// Check if this is a CORS preflight request
///
/// Preflight requests are OPTIONS requests with:
/// - Origin header present
/// - Access-Control-Request-Method header present
fn is_preflight_request(method: &Method, headers: &HeaderMap) -> bool {
    method == Method::OPTIONS
        && headers.contains_key(header::ORIGIN)
        && headers.contains_key(header::ACCESS_CONTROL_REQUEST_METHOD)
}
