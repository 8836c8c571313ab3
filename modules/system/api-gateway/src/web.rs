use axum::Json;
use axum::http::header;
use axum::response::{Html, IntoResponse, Response};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use utoipa::{OpenApi, ToSchema};

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthStatus {
    pub status: String,
    /// RFC 3339 UTC timestamp.
    pub timestamp: String,
}

/// Liveness probe.
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses((status = 200, body = HealthStatus))
)]
pub async fn health_check() -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "healthy".to_owned(),
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    })
}

pub async fn healthz() -> &'static str {
    "ok"
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "MLOps API Gateway",
        description = "Authorizing reverse proxy in front of the experiment tracker and feature store"
    ),
    paths(
        health_check,
        crate::oauth::authorize,
        crate::oauth::token,
        crate::oauth::callback,
        crate::handlers::user_profile,
        crate::handlers::set_experiment_permissions,
        crate::handlers::list_experiment_permissions,
    ),
    components(schemas(
        HealthStatus,
        crate::problem::Problem,
        crate::oauth::AuthorizationUrl,
        crate::handlers::UserProfile,
        crate::handlers::ProfilePermissions,
        crate::handlers::SetPermissionsRequest,
        crate::handlers::SetPermissionsResponse,
        crate::permissions::ResourceGrant,
    )),
    modifiers(&BearerAuth),
    tags(
        (name = "health"),
        (name = "oauth", description = "Authorization-code flow with the identity provider"),
        (name = "user"),
        (name = "admin", description = "Per-experiment permission grants")
    )
)]
pub struct ApiDoc;

struct BearerAuth;

impl utoipa::Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};

        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer",
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .bearer_format("JWT")
                    .build(),
            ),
        );
    }
}

pub async fn openapi_json() -> Response {
    match ApiDoc::openapi().to_pretty_json() {
        Ok(json) => (
            [
                (header::CONTENT_TYPE, "application/json"),
                (header::CACHE_CONTROL, "no-store"),
            ],
            json,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("Failed to serialize OpenAPI doc: {}", e);
            axum::http::StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

const DOCS_HTML: &str = r#"<!doctype html>
<html lang="en">
  <head>
    <meta charset="utf-8" />
    <title>MLOps API Gateway</title>
    <script src="https://unpkg.com/@stoplight/elements/web-components.min.js"></script>
    <link rel="stylesheet" href="https://unpkg.com/@stoplight/elements/styles.min.css" />
  </head>
  <body>
    <elements-api apiDescriptionUrl="/openapi.json" router="hash" layout="sidebar"></elements-api>
  </body>
</html>
"#;

pub async fn serve_docs() -> Html<&'static str> {
    Html(DOCS_HTML)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn openapi_lists_gateway_paths() {
        let doc = ApiDoc::openapi();
        for path in ["/health", "/oauth/authorize", "/user/profile", "/admin/experiments/{experiment_id}/permissions"] {
            assert!(doc.paths.paths.contains_key(path), "{path} missing");
        }
        let schemes = doc.components.unwrap().security_schemes;
        assert!(schemes.contains_key("bearer"));
    }

    #[tokio::test]
    async fn health_reports_healthy() {
        let Json(health) = health_check().await;
        assert_eq!(health.status, "healthy");
        assert!(health.timestamp.ends_with('Z'));
    }
}
