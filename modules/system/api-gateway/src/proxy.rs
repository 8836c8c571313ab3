//! Forwarding proxy: relays an authorized request to an upstream service with
//! the caller's identity attached.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use chrono::Utc;
use http::Request;
use http_body_util::Full;
use mlops_security::Identity;
use secrecy::ExposeSecret;
use serde_json::Value;
use url::Url;

use crate::config::GatewayConfig;
use crate::error::ProxyError;
use crate::http_client::{self, HttpClientError, HttpsClient};
use crate::session::SessionStore;

pub const X_USER_ID: HeaderName = HeaderName::from_static("x-user-id");
pub const X_USER_EMAIL: HeaderName = HeaderName::from_static("x-user-email");
pub const X_USER_NAME: HeaderName = HeaderName::from_static("x-user-name");
pub const X_USER_GROUPS: HeaderName = HeaderName::from_static("x-user-groups");
pub const X_USER_ROLES: HeaderName = HeaderName::from_static("x-user-roles");

/// Upstream response headers passed back to the client alongside the body.
const RELAYED_HEADERS: [HeaderName; 3] = [header::LOCATION, header::CACHE_CONTROL, header::ETAG];

/// An upstream response as it will be returned to the client.
///
/// The body is always JSON: JSON payloads are decoded and re-encoded, anything
/// else is wrapped as `{"data": "<text>"}`.
#[derive(Debug, Clone)]
pub struct RelayedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

impl RelayedResponse {
    fn from_upstream(response: &http::Response<Bytes>) -> Self {
        let is_json = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("json"));

        let raw = response.body();
        let body = if is_json {
            serde_json::from_slice(raw).unwrap_or_else(|_| wrap_text(raw))
        } else {
            wrap_text(raw)
        };

        let mut headers = HeaderMap::new();
        for name in RELAYED_HEADERS {
            if let Some(value) = response.headers().get(&name) {
                headers.insert(name, value.clone());
            }
        }

        Self {
            status: response.status(),
            headers,
            body,
        }
    }
}

fn wrap_text(raw: &[u8]) -> Value {
    serde_json::json!({ "data": String::from_utf8_lossy(raw) })
}

impl IntoResponse for RelayedResponse {
    fn into_response(self) -> Response {
        (self.status, self.headers, axum::Json(self.body)).into_response()
    }
}

/// A request ready to be sent upstream.
#[derive(Debug, Clone, Default)]
pub struct ForwardRequest {
    pub service: String,
    pub method: Method,
    /// Decoded path segments, appended to the service base URL.
    pub segments: Vec<String>,
    /// Already encoded query string.
    pub query: Option<String>,
    pub content_type: Option<HeaderValue>,
    pub accept: Option<HeaderValue>,
    pub body: Bytes,
}

impl ForwardRequest {
    #[must_use]
    pub fn new<I, S>(service: impl Into<String>, method: Method, segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            service: service.into(),
            method,
            segments: segments.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_query(mut self, query: Option<String>) -> Self {
        self.query = query.filter(|q| !q.is_empty());
        self
    }

    /// Copy the body and the negotiation headers of the inbound request.
    #[must_use]
    pub fn with_inbound(mut self, headers: &HeaderMap, body: Bytes) -> Self {
        self.content_type = headers.get(header::CONTENT_TYPE).cloned();
        self.accept = headers.get(header::ACCEPT).cloned();
        self.body = body;
        self
    }
}

/// Append `segments` to `base` (percent-encoding each one) and set `query`.
///
/// # Errors
/// Fails when `base` is not an absolute hierarchical URL.
pub fn upstream_url(base: &str, segments: &[String], query: Option<&str>) -> Result<Url, String> {
    let mut url = Url::parse(base).map_err(|e| format!("invalid base URL '{base}': {e}"))?;
    {
        let mut path = url
            .path_segments_mut()
            .map_err(|()| format!("base URL '{base}' cannot carry a path"))?;
        path.pop_if_empty().extend(segments);
    }
    url.set_query(query.filter(|q| !q.is_empty()));
    Ok(url)
}

/// Concatenate query strings, skipping empty parts.
#[must_use]
pub fn merge_query(first: Option<&str>, second: Option<&str>) -> Option<String> {
    let parts: Vec<&str> = [first, second]
        .into_iter()
        .flatten()
        .filter(|q| !q.is_empty())
        .collect();
    (!parts.is_empty()).then(|| parts.join("&"))
}

#[derive(Clone)]
pub struct ForwardingProxy {
    upstreams: Arc<BTreeMap<String, String>>,
    client: HttpsClient,
    timeout: Duration,
    response_limit: usize,
    sessions: SessionStore,
    reattach_session_token: bool,
}

/// Default cap on a relayed upstream body.
pub const DEFAULT_RESPONSE_LIMIT: usize = 32 * 1024 * 1024;

impl fmt::Debug for ForwardingProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForwardingProxy")
            .field("upstreams", &self.upstreams)
            .field("timeout", &self.timeout)
            .field("response_limit", &self.response_limit)
            .field("reattach_session_token", &self.reattach_session_token)
            .finish_non_exhaustive()
    }
}

impl ForwardingProxy {
    #[must_use]
    pub fn new(
        upstreams: BTreeMap<String, String>,
        client: HttpsClient,
        timeout: Duration,
        sessions: SessionStore,
    ) -> Self {
        Self {
            upstreams: Arc::new(upstreams),
            client,
            timeout,
            response_limit: DEFAULT_RESPONSE_LIMIT,
            sessions,
            reattach_session_token: false,
        }
    }

    #[must_use]
    pub fn from_config(cfg: &GatewayConfig, client: HttpsClient, sessions: SessionStore) -> Self {
        Self::new(cfg.upstreams.clone(), client, cfg.proxy.timeout(), sessions)
            .with_session_reattachment(cfg.proxy.reattach_session_token)
            .with_response_limit(cfg.proxy.max_response_bytes)
    }

    #[must_use]
    pub fn with_response_limit(mut self, bytes: usize) -> Self {
        self.response_limit = bytes;
        self
    }

    /// Forward the subject's stored session token instead of the presented one.
    #[must_use]
    pub fn with_session_reattachment(mut self, enabled: bool) -> Self {
        self.reattach_session_token = enabled;
        self
    }

    /// Base URL of a configured upstream.
    ///
    /// # Errors
    /// `UnknownService` when `service` is not configured.
    pub fn upstream_base(&self, service: &str) -> Result<&str, ProxyError> {
        self.upstreams
            .get(service)
            .map(String::as_str)
            .ok_or_else(|| ProxyError::UnknownService(service.to_owned()))
    }

    /// Send `request` upstream on behalf of `identity`.
    ///
    /// Dropping the returned future cancels the upstream call.
    ///
    /// # Errors
    /// `UpstreamUnavailable` on network failure or timeout, `UpstreamError`
    /// carrying the relayed response for any non-2xx/3xx status.
    pub async fn forward(
        &self,
        identity: &Identity,
        request: ForwardRequest,
    ) -> Result<RelayedResponse, ProxyError> {
        let base = self.upstream_base(&request.service)?;
        let service = request.service;
        let url = upstream_url(base, &request.segments, request.query.as_deref())
            .map_err(|reason| ProxyError::unavailable(&service, reason))?;

        let mut builder = Request::builder()
            .method(request.method.clone())
            .uri(url.as_str());
        if let Some(headers) = builder.headers_mut() {
            self.inject_identity(headers, identity);
            if let Some(ct) = request.content_type {
                headers.insert(header::CONTENT_TYPE, ct);
            }
            if let Some(accept) = request.accept {
                headers.insert(header::ACCEPT, accept);
            }
        }
        let upstream_request = builder
            .body(Full::new(request.body))
            .map_err(|e| ProxyError::unavailable(&service, format!("invalid upstream URL: {e}")))?;

        tracing::debug!(
            service = %service,
            method = %request.method,
            url = %url,
            subject_id = %identity.subject_id(),
            "Forwarding request upstream"
        );

        let response = http_client::send(
            &self.client,
            upstream_request,
            self.timeout,
            self.response_limit,
        )
        .await
        .map_err(|e| match e {
            HttpClientError::Timeout(_) => ProxyError::unavailable(&service, "timed out"),
            other => ProxyError::unavailable(&service, other),
        })?;

        let relayed = RelayedResponse::from_upstream(&response);
        if relayed.status.is_success() || relayed.status.is_redirection() {
            Ok(relayed)
        } else {
            Err(ProxyError::UpstreamError(relayed))
        }
    }

    fn inject_identity(&self, headers: &mut HeaderMap, identity: &Identity) {
        let fields = [
            (X_USER_ID, identity.subject_id().to_owned()),
            (X_USER_EMAIL, identity.email().to_owned()),
            (X_USER_NAME, identity.display_name().to_owned()),
            (X_USER_GROUPS, identity.groups_header()),
            (X_USER_ROLES, identity.roles_header()),
        ];
        for (name, value) in fields {
            match HeaderValue::from_bytes(value.as_bytes()) {
                Ok(value) => {
                    headers.insert(name, value);
                }
                Err(_) => tracing::warn!(header = %name, "Identity value not representable as header; omitted"),
            }
        }

        if let Some(token) = self.outbound_token(identity) {
            match HeaderValue::from_str(&format!("Bearer {token}")) {
                Ok(mut value) => {
                    value.set_sensitive(true);
                    headers.insert(header::AUTHORIZATION, value);
                }
                Err(_) => tracing::warn!("Bearer token not representable as header; omitted"),
            }
        }
    }

    fn outbound_token(&self, identity: &Identity) -> Option<String> {
        if self.reattach_session_token
            && let Some(session) = self.sessions.get_active(identity.subject_id(), Utc::now())
        {
            return Some(session.bearer_token.expose_secret().to_owned());
        }
        identity
            .bearer_token()
            .map(|t| t.expose_secret().to_owned())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn segments(path: &str) -> Vec<String> {
        path.split('/').map(str::to_owned).collect()
    }

    #[test]
    fn upstream_url_appends_segments() {
        assert_eq!(
            upstream_url(
                "http://mlflow:5000/",
                &segments("api/2.0/mlflow/experiments/list"),
                None
            )
            .unwrap()
            .as_str(),
            "http://mlflow:5000/api/2.0/mlflow/experiments/list"
        );
        assert_eq!(
            upstream_url("http://feast:6566", &segments("features"), Some("a=1"))
                .unwrap()
                .as_str(),
            "http://feast:6566/features?a=1"
        );
        assert_eq!(
            upstream_url("http://x/", &segments("p"), Some("")).unwrap().as_str(),
            "http://x/p"
        );
    }

    #[test]
    fn upstream_url_keeps_base_prefix() {
        assert_eq!(
            upstream_url("http://x/prefix/", &segments("a/b"), None)
                .unwrap()
                .as_str(),
            "http://x/prefix/a/b"
        );
    }

    #[test]
    fn upstream_url_encodes_segments() {
        let url = upstream_url("http://x", &["a b".to_owned(), "c?d".to_owned()], None).unwrap();
        assert_eq!(url.as_str(), "http://x/a%20b/c%3Fd");
    }

    #[test]
    fn merge_query_skips_empty_parts() {
        assert_eq!(merge_query(None, None), None);
        assert_eq!(merge_query(Some(""), Some("b=2")), Some("b=2".to_owned()));
        assert_eq!(
            merge_query(Some("experiment_id=42"), Some("max_results=5")),
            Some("experiment_id=42&max_results=5".to_owned())
        );
    }

    #[test]
    fn json_upstream_body_is_reencoded() {
        let upstream = http::Response::builder()
            .status(404)
            .header(header::CONTENT_TYPE, "application/json; charset=utf-8")
            .body(Bytes::from_static(br#"{"error": "not_found"}"#))
            .unwrap();
        let relayed = RelayedResponse::from_upstream(&upstream);
        assert_eq!(relayed.status, StatusCode::NOT_FOUND);
        assert_eq!(relayed.body, serde_json::json!({"error": "not_found"}));
    }

    #[test]
    fn text_upstream_body_is_wrapped() {
        let upstream = http::Response::builder()
            .status(200)
            .header(header::CONTENT_TYPE, "text/plain")
            .body(Bytes::from_static(b"pong"))
            .unwrap();
        let relayed = RelayedResponse::from_upstream(&upstream);
        assert_eq!(relayed.body, serde_json::json!({"data": "pong"}));
    }

    #[test]
    fn invalid_json_falls_back_to_wrapping() {
        let upstream = http::Response::builder()
            .status(500)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Bytes::from_static(b"<html>oops</html>"))
            .unwrap();
        let relayed = RelayedResponse::from_upstream(&upstream);
        assert_eq!(relayed.body["data"], "<html>oops</html>");
    }
}
