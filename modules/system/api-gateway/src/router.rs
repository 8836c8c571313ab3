//! Request router: maps inbound routes to upstream targets and the permission
//! check each one needs, then runs the authorize-then-forward pipeline.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{FromRequestParts, Path, Request};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, Method};
use axum::response::{IntoResponse, Response};
use axum::routing::{MethodFilter, MethodRouter, any, on};
use mlops_security::{Identity, Permission};
use serde_json::Value;
use url::form_urlencoded;

use crate::config::MLFLOW_SERVICE;
use crate::error::{AuthError, AuthzError, GatewayError};
use crate::permissions::PermissionEngine;
use crate::proxy::{ForwardRequest, ForwardingProxy, RelayedResponse, merge_query};

/// Captured path parameters by name.
pub type PathParams = BTreeMap<String, String>;

/// Which permission check a route performs before forwarding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceCheck {
    /// Authenticated callers only.
    None,
    /// Role-only check; the route does not name an existing resource.
    Global,
    /// Per-resource check on the named path parameter.
    PathParam(&'static str),
}

/// Where a route's requests go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upstream {
    Service(&'static str),
    /// Service name taken from the named path parameter.
    PathParam(&'static str),
}

/// One row of the routing table.
#[derive(Debug, Clone)]
pub struct RouteSpec {
    /// `None` matches any method.
    pub method: Option<Method>,
    /// Inbound axum path pattern.
    pub path: &'static str,
    pub upstream: Upstream,
    /// Upstream path template: `{param}` segments, `{*param}` for a
    /// multi-segment capture, optional `?k={param}` query part.
    pub target: &'static str,
    pub check: ResourceCheck,
    pub permission: Permission,
    /// Path parameter whose value is pinned into the same-named top-level
    /// field of the JSON request body.
    pub body_binding: Option<&'static str>,
}

impl RouteSpec {
    fn mlflow(
        method: Method,
        path: &'static str,
        target: &'static str,
        check: ResourceCheck,
        permission: Permission,
    ) -> Self {
        Self {
            method: Some(method),
            path,
            upstream: Upstream::Service(MLFLOW_SERVICE),
            target,
            check,
            permission,
            body_binding: None,
        }
    }

    #[must_use]
    fn binding_body(mut self, param: &'static str) -> Self {
        self.body_binding = Some(param);
        self
    }

    fn has_params(&self) -> bool {
        self.path.contains('{')
    }

    /// Query keys the caller may not supply: those the target template sets,
    /// plus the parameter a per-resource check was made on.
    #[must_use]
    pub fn reserved_query_keys(&self) -> Vec<&'static str> {
        let mut keys: Vec<&'static str> = self
            .target
            .split_once('?')
            .map(|(_, query)| {
                query
                    .split('&')
                    .map(|pair| pair.split_once('=').map_or(pair, |(key, _)| key))
                    .filter(|key| !key.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        if let ResourceCheck::PathParam(name) = self.check
            && !keys.contains(&name)
        {
            keys.push(name);
        }
        keys
    }
}

/// Experiment-tracker routes and the generic passthrough.
#[must_use]
pub fn route_table() -> Vec<RouteSpec> {
    use ResourceCheck::{Global, PathParam};

    vec![
        RouteSpec::mlflow(
            Method::GET,
            "/mlflow/experiments",
            "api/2.0/mlflow/experiments/list",
            ResourceCheck::None,
            Permission::Read,
        ),
        RouteSpec::mlflow(
            Method::POST,
            "/mlflow/experiments",
            "api/2.0/mlflow/experiments/create",
            Global,
            Permission::Write,
        ),
        RouteSpec::mlflow(
            Method::GET,
            "/mlflow/experiments/{experiment_id}",
            "api/2.0/mlflow/experiments/get?experiment_id={experiment_id}",
            PathParam("experiment_id"),
            Permission::Read,
        ),
        RouteSpec::mlflow(
            Method::POST,
            "/mlflow/experiments/{experiment_id}/runs",
            "api/2.0/mlflow/runs/create",
            PathParam("experiment_id"),
            Permission::Write,
        )
        .binding_body("experiment_id"),
        RouteSpec::mlflow(
            Method::GET,
            "/mlflow/experiments/{experiment_id}/runs",
            "api/2.0/mlflow/runs/search?experiment_ids={experiment_id}",
            PathParam("experiment_id"),
            Permission::Read,
        ),
        RouteSpec::mlflow(
            Method::POST,
            "/mlflow/models/register",
            "api/2.0/mlflow/model-versions/create",
            Global,
            Permission::Write,
        ),
        RouteSpec::mlflow(
            Method::GET,
            "/mlflow/models",
            "api/2.0/mlflow/registered-models/search",
            ResourceCheck::None,
            Permission::Read,
        ),
        RouteSpec {
            method: None,
            path: "/proxy/{service}/{*path}",
            upstream: Upstream::PathParam("service"),
            target: "{*path}",
            check: ResourceCheck::None,
            permission: Permission::Read,
            body_binding: None,
        },
    ]
}

/// Upstream path segments and encoded query produced from a target template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedTarget {
    pub segments: Vec<String>,
    pub query: Option<String>,
}

fn param<'a>(params: &'a PathParams, name: &str) -> Result<&'a str, GatewayError> {
    params
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| GatewayError::internal(format!("route parameter '{name}' not captured")))
}

fn checked_segment(segment: &str) -> Result<&str, GatewayError> {
    if matches!(segment, "." | "..") {
        return Err(GatewayError::bad_request("relative path segments are not allowed"));
    }
    Ok(segment)
}

/// Fill a target template with captured path parameters.
///
/// # Errors
/// `BadRequest` for `.`/`..` segments in captured values; `Internal` when the
/// template names a parameter the route does not capture.
pub fn render_target(
    template: &str,
    params: &PathParams,
) -> Result<RenderedTarget, GatewayError> {
    let (path, query) = template
        .split_once('?')
        .map_or((template, None), |(p, q)| (p, Some(q)));

    let mut segments = Vec::new();
    for part in path.split('/').filter(|p| !p.is_empty()) {
        if let Some(name) = part.strip_prefix("{*").and_then(|p| p.strip_suffix('}')) {
            for segment in param(params, name)?.split('/').filter(|s| !s.is_empty()) {
                segments.push(checked_segment(segment)?.to_owned());
            }
        } else if let Some(name) = part.strip_prefix('{').and_then(|p| p.strip_suffix('}')) {
            segments.push(checked_segment(param(params, name)?)?.to_owned());
        } else {
            segments.push(part.to_owned());
        }
    }

    let query = match query {
        Some(query) => {
            let mut serializer = form_urlencoded::Serializer::new(String::new());
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                let value = match value.strip_prefix('{').and_then(|v| v.strip_suffix('}')) {
                    Some(name) => param(params, name)?,
                    None => value,
                };
                serializer.append_pair(key, value);
            }
            Some(serializer.finish()).filter(|q| !q.is_empty())
        }
        None => None,
    };

    Ok(RenderedTarget { segments, query })
}

/// Reject a caller query that tries to set a key the route controls.
///
/// # Errors
/// `BadRequest` naming the first reserved key found.
pub fn check_inbound_query(spec: &RouteSpec, inbound: Option<&str>) -> Result<(), GatewayError> {
    let Some(inbound) = inbound else {
        return Ok(());
    };
    let reserved = spec.reserved_query_keys();
    if reserved.is_empty() {
        return Ok(());
    }
    for (key, _) in form_urlencoded::parse(inbound.as_bytes()) {
        if reserved.contains(&key.as_ref()) {
            return Err(GatewayError::bad_request(format!(
                "query parameter '{key}' is set by the route and cannot be supplied"
            )));
        }
    }
    Ok(())
}

/// Pin the route's bound path parameter into the JSON body.
///
/// A missing field is filled in; a field carrying a different resource id is
/// rejected. Returns `None` when the route binds nothing and the body is
/// forwarded untouched.
///
/// # Errors
/// `BadRequest` for a body that is not a JSON object or names another resource.
pub fn bind_body(
    spec: &RouteSpec,
    params: &PathParams,
    body: &Bytes,
) -> Result<Option<Bytes>, GatewayError> {
    let Some(name) = spec.body_binding else {
        return Ok(None);
    };
    let expected = param(params, name)?;

    let mut object = if body.iter().all(u8::is_ascii_whitespace) {
        serde_json::Map::new()
    } else {
        let Ok(Value::Object(object)) = serde_json::from_slice::<Value>(body) else {
            return Err(GatewayError::bad_request("request body must be a JSON object"));
        };
        object
    };

    let matches = match object.get(name) {
        None => {
            object.insert(name.to_owned(), Value::String(expected.to_owned()));
            true
        }
        Some(Value::String(value)) => value == expected,
        Some(Value::Number(value)) => value.to_string() == expected,
        Some(_) => false,
    };
    if !matches {
        return Err(GatewayError::bad_request(format!(
            "body field '{name}' does not match the resource in the path"
        )));
    }

    serde_json::to_vec(&Value::Object(object))
        .map(|encoded| Some(Bytes::from(encoded)))
        .map_err(|e| GatewayError::internal(format!("failed to encode request body: {e}")))
}

/// Pipeline stages shared by every routed request.
#[derive(Debug, Clone)]
pub struct Pipeline {
    pub permissions: PermissionEngine,
    pub proxy: ForwardingProxy,
}

impl Pipeline {
    #[must_use]
    pub fn new(permissions: PermissionEngine, proxy: ForwardingProxy) -> Self {
        Self { permissions, proxy }
    }

    /// Authorization stage. Nothing is sent upstream unless this succeeds.
    ///
    /// # Errors
    /// `AuthzError::Forbidden` when the permission engine denies the action.
    pub fn authorize(
        &self,
        spec: &RouteSpec,
        identity: &Identity,
        params: &PathParams,
    ) -> Result<(), GatewayError> {
        let allowed = match spec.check {
            ResourceCheck::None => true,
            ResourceCheck::Global => self
                .permissions
                .authorize_global(identity, spec.permission),
            ResourceCheck::PathParam(name) => {
                let resource_id = param(params, name)?;
                self.permissions
                    .authorize(identity, resource_id, spec.permission)
            }
        };
        if allowed {
            Ok(())
        } else {
            Err(AuthzError::forbidden(format!(
                "{} permission required",
                spec.permission
            ))
            .into())
        }
    }

    /// Routing stage: resolve the upstream service and target.
    ///
    /// # Errors
    /// See [`check_inbound_query`] and [`render_target`].
    pub fn route(
        &self,
        spec: &RouteSpec,
        method: Method,
        params: &PathParams,
        inbound_query: Option<&str>,
    ) -> Result<ForwardRequest, GatewayError> {
        check_inbound_query(spec, inbound_query)?;
        let service = match spec.upstream {
            Upstream::Service(service) => service,
            Upstream::PathParam(name) => param(params, name)?,
        };
        let target = render_target(spec.target, params)?;
        let query = merge_query(target.query.as_deref(), inbound_query);
        Ok(ForwardRequest::new(service, method, target.segments).with_query(query))
    }

    /// authorize → route → forward.
    ///
    /// # Errors
    /// Whichever stage fails first.
    pub async fn run(
        &self,
        spec: &RouteSpec,
        identity: &Identity,
        request: InboundRequest,
    ) -> Result<RelayedResponse, GatewayError> {
        self.authorize(spec, identity, &request.params)?;
        let bound = bind_body(spec, &request.params, &request.body)?;
        let routed = self.route(
            spec,
            request.method,
            &request.params,
            request.query.as_deref(),
        )?;
        let forward = match bound {
            Some(body) => {
                let mut forward = routed.with_inbound(&request.headers, body);
                forward.content_type = Some(HeaderValue::from_static("application/json"));
                forward
            }
            None => routed.with_inbound(&request.headers, request.body),
        };
        Ok(self.proxy.forward(identity, forward).await?)
    }
}

/// The parts of an inbound request the pipeline consumes.
#[derive(Debug, Clone, Default)]
pub struct InboundRequest {
    pub method: Method,
    pub params: PathParams,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl InboundRequest {
    async fn extract(spec: &RouteSpec, request: Request) -> Result<(Identity, Self), GatewayError> {
        let (mut parts, body) = request.into_parts();
        let identity = parts
            .extensions
            .get::<Identity>()
            .cloned()
            .ok_or(AuthError::Missing)?;
        let params = if spec.has_params() {
            path_params(&mut parts).await?
        } else {
            PathParams::new()
        };
        let body = axum::body::to_bytes(body, usize::MAX)
            .await
            .map_err(|e| GatewayError::bad_request(format!("failed to read request body: {e}")))?;

        Ok((
            identity,
            Self {
                method: parts.method,
                params,
                query: parts.uri.query().map(str::to_owned),
                headers: parts.headers,
                body,
            },
        ))
    }
}

async fn path_params(parts: &mut Parts) -> Result<PathParams, GatewayError> {
    Path::<PathParams>::from_request_parts(parts, &())
        .await
        .map(|Path(params)| params)
        .map_err(|e| GatewayError::bad_request(e.body_text()))
}

async fn handle(pipeline: Pipeline, spec: Arc<RouteSpec>, request: Request) -> Response {
    let result = async {
        let (identity, inbound) = InboundRequest::extract(&spec, request).await?;
        pipeline.run(&spec, &identity, inbound).await
    }
    .await;
    match result {
        Ok(relayed) => relayed.into_response(),
        Err(err) => err.into_response(),
    }
}

/// Build the axum routes for `table`. Rows sharing a path are merged by method.
///
/// # Errors
/// Fails on a method axum cannot route on.
pub fn routes<S>(table: Vec<RouteSpec>, pipeline: &Pipeline) -> anyhow::Result<Router<S>>
where
    S: Clone + Send + Sync + 'static,
{
    let mut by_path: BTreeMap<&'static str, MethodRouter<S>> = BTreeMap::new();

    for spec in table {
        let path = spec.path;
        let filter = spec
            .method
            .clone()
            .map(MethodFilter::try_from)
            .transpose()
            .map_err(|e| anyhow::anyhow!("route {path}: {e}"))?;
        let spec = Arc::new(spec);
        let pipeline = pipeline.clone();
        let handler = move |request: Request| handle(pipeline.clone(), Arc::clone(&spec), request);

        let method_router = by_path.remove(path);
        let method_router = match (method_router, filter) {
            (Some(existing), Some(filter)) => existing.on(filter, handler),
            (None, Some(filter)) => on(filter, handler),
            (_, None) => any(handler),
        };
        by_path.insert(path, method_router);
    }

    Ok(by_path
        .into_iter()
        .fold(Router::new(), |router, (path, method_router)| {
            router.route(path, method_router)
        }))
}
