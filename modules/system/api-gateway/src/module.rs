//! API Gateway module definition
//!
//! Contains the `ApiGateway` struct: startup wiring, the HTTP router with its
//! middleware stack, and the serve loop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::StatusCode;
use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{get, post};
use axum::{Router, extract::DefaultBodyLimit};
use tokio_util::sync::CancellationToken;
use tower_http::{
    limit::RequestBodyLimitLayer,
    request_id::{PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
};

use crate::auth;
use crate::config::GatewayConfig;
use crate::http_client::{self, HttpsClient};
use crate::middleware;
use crate::oauth::{self, OAuthClient};
use crate::permissions::{GrantTable, PermissionEngine};
use crate::proxy::ForwardingProxy;
use crate::router::{self, Pipeline};
use crate::session::SessionStore;
use crate::verifier::{JwksCache, JwtTokenVerifier, JwtValidationSettings, TokenVerifier};
use crate::{handlers, web};

/// State shared by every handler.
#[derive(Debug, Clone)]
pub struct GatewayState {
    pub pipeline: Pipeline,
    pub oauth: OAuthClient,
}

/// The gateway: owns the process-wide stores and builds the HTTP server.
pub struct ApiGateway {
    config: Arc<GatewayConfig>,
    verifier: Arc<dyn TokenVerifier>,
    state: GatewayState,
}

impl ApiGateway {
    /// Production startup: build the outbound client, fetch the signing keys
    /// and wire every component. Any failure here must stop the process.
    ///
    /// # Errors
    /// Invalid configuration, TLS setup failure, or an unreachable key-set endpoint.
    pub async fn bootstrap(config: GatewayConfig) -> Result<Self> {
        config.validate()?;

        let client = http_client::build_client().context("failed to build HTTP client")?;
        let sessions = SessionStore::new(Duration::from_secs(config.security.session_ttl_secs));

        let keys = Arc::new(JwksCache::new(
            config.entra_id.jwks_uri(),
            client.clone(),
            Duration::from_secs(config.security.key_fetch_timeout_secs),
            Duration::from_secs(config.security.key_refresh_interval_secs),
        )
        .with_min_refresh_interval(Duration::from_secs(
            config.security.key_min_refresh_interval_secs,
        )));
        keys.prefetch()
            .await
            .with_context(|| format!("failed to fetch signing keys from {}", keys.jwks_uri()))?;

        let settings =
            JwtValidationSettings::from_config(&config.entra_id, config.security.leeway_secs)?;
        let verifier = Arc::new(JwtTokenVerifier::new(keys, sessions.clone(), settings));

        Ok(Self::with_components(config, verifier, client, sessions))
    }

    /// Wire the gateway around an existing verifier, client and session store.
    #[must_use]
    pub fn with_components(
        config: GatewayConfig,
        verifier: Arc<dyn TokenVerifier>,
        client: HttpsClient,
        sessions: SessionStore,
    ) -> Self {
        let permissions = PermissionEngine::new(GrantTable::new(), config.security.roles.clone());
        let proxy = ForwardingProxy::from_config(&config, client.clone(), sessions);
        let oauth = OAuthClient::new(&config.entra_id, client, config.proxy.timeout());

        Self {
            config: Arc::new(config),
            verifier,
            state: GatewayState {
                pipeline: Pipeline::new(permissions, proxy),
                oauth,
            },
        }
    }

    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> &GatewayState {
        &self.state
    }

    /// Apply all middleware layers to a router (request ID, tracing, timeout, body limit, CORS, auth)
    pub(crate) fn apply_middleware_stack(&self, mut router: Router) -> Result<Router> {
        // IMPORTANT: `axum::Router::layer(...)` behaves like Tower layers: the **last** added layer
        // becomes the **outermost** layer and therefore runs **first** on the request path.
        //
        // Desired request execution order (outermost -> innermost):
        // SetRequestId -> PropagateRequestId -> Trace -> push_req_id_to_extensions
        // -> Timeout -> BodyLimit -> CORS -> Auth -> Router
        //
        // Therefore we must add layers in the reverse order (innermost -> outermost) below.
        let server = &self.config.server;

        // 6) Auth
        let auth_state = auth::AuthState {
            verifier: Arc::clone(&self.verifier),
            route_policy: auth::build_route_policy(auth::PUBLIC_ROUTES)?,
        };
        router = router.layer(from_fn_with_state(auth_state, auth::authn_middleware));

        // 5) CORS (must be outer to auth so OPTIONS preflight short-circuits)
        if server.cors_enabled {
            router = router.layer(crate::cors::build_cors_layer(server));
        }

        // 4) Body limit
        router = router.layer(RequestBodyLimitLayer::new(server.body_limit_bytes));
        router = router.layer(DefaultBodyLimit::max(server.body_limit_bytes));

        // 3) Timeout
        router = router.layer(TimeoutLayer::with_status_code(
            StatusCode::GATEWAY_TIMEOUT,
            Duration::from_secs(server.request_timeout_secs),
        ));

        // 2) Record request_id into span + extensions (requires span to exist first => must be inner to Trace)
        router = router.layer(from_fn(middleware::request_id::push_req_id_to_extensions));

        // 1) Trace
        router = router.layer({
            use tower_http::trace::TraceLayer;
            use tracing::field::Empty;

            TraceLayer::new_for_http()
                .make_span_with(move |req: &axum::http::Request<axum::body::Body>| {
                    let hdr = middleware::request_id::header();
                    let rid = req
                        .headers()
                        .get(&hdr)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("n/a");

                    tracing::info_span!(
                        "http_request",
                        method = %req.method(),
                        uri = %req.uri().path(),
                        version = ?req.version(),
                        module = "api_gateway",
                        request_id = %rid,
                        status = Empty,
                        latency_ms = Empty,
                    )
                })
                .on_response(
                    |res: &axum::http::Response<axum::body::Body>,
                     latency: Duration,
                     span: &tracing::Span| {
                        span.record("status", res.status().as_u16());
                        span.record("latency_ms", latency.as_millis());
                    },
                )
        });

        // 0) Request ID handling
        let x_request_id = middleware::request_id::header();
        // If missing, generate x-request-id first; then propagate it to the response.
        router = router.layer(PropagateRequestIdLayer::new(x_request_id.clone()));
        router = router.layer(SetRequestIdLayer::new(
            x_request_id,
            middleware::request_id::MakeReqId,
        ));

        Ok(router)
    }

    /// Build the HTTP router: local endpoints, routed upstream endpoints, middleware.
    ///
    /// # Errors
    /// Returns an error if a route pattern is rejected.
    pub fn build_router(&self) -> Result<Router> {
        let mut router: Router<GatewayState> = Router::new()
            .route("/health", get(web::health_check))
            .route("/healthz", get(web::healthz))
            .route("/oauth/authorize", get(oauth::authorize))
            .route("/oauth/token", post(oauth::token))
            .route("/oauth/callback", get(oauth::callback))
            .route("/user/profile", get(handlers::user_profile))
            .route(
                "/admin/experiments/{experiment_id}/permissions",
                post(handlers::set_experiment_permissions)
                    .get(handlers::list_experiment_permissions),
            );

        if self.config.server.enable_docs {
            router = router
                .route("/openapi.json", get(web::openapi_json))
                .route("/docs", get(web::serve_docs));
        }

        let routed = router::routes(router::route_table(), &self.state.pipeline)?;
        let router = router.merge(routed).with_state(self.state.clone());

        self.apply_middleware_stack(router)
    }

    /// Bind the configured address and serve until `cancel` fires.
    ///
    /// # Errors
    /// Bind failure or a fatal server error.
    pub async fn serve(&self, cancel: CancellationToken) -> Result<()> {
        let addr = self.config.bind_addr();
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        self.serve_on(listener, cancel).await
    }

    /// Serve on an already bound listener until `cancel` fires.
    ///
    /// # Errors
    /// A fatal server error.
    pub async fn serve_on(
        &self,
        listener: tokio::net::TcpListener,
        cancel: CancellationToken,
    ) -> Result<()> {
        let router = self.build_router()?;
        tracing::info!("HTTP server bound on {}", listener.local_addr()?);

        // Graceful shutdown on cancel
        let shutdown = async move {
            cancel.cancelled().await;
            tracing::info!("HTTP server shutting down gracefully (cancellation)");
        };

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| anyhow::anyhow!(e))
    }
}
