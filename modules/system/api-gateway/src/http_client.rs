//! Shared outbound HTTP client (signing keys, token exchange, upstream forwarding).

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{Request, Response};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use thiserror::Error;

pub type HttpsClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Cap for identity-provider responses (key sets, token exchange).
pub const IDENTITY_PROVIDER_BODY_LIMIT: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum HttpClientError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("request failed: {0}")]
    Transport(String),

    #[error("failed to read response body: {0}")]
    Body(String),

    #[error("response body exceeds {0} bytes")]
    TooLarge(usize),
}

/// Build the HTTPS-or-HTTP client backed by the platform's native root store.
///
/// # Errors
/// Fails when the TLS provider rejects the default protocol versions.
pub fn build_client() -> anyhow::Result<HttpsClient> {
    let mut roots = rustls::RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for err in &native.errors {
        tracing::warn!("Skipping native root certificate: {err}");
    }
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    tracing::debug!(added, ignored, "Loaded native root certificates");
    if roots.is_empty() {
        tracing::warn!("No native root certificates found; only plain HTTP targets will work");
    }

    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let tls = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();

    let connector = hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(tls)
        .https_or_http()
        .enable_http1()
        .build();

    Ok(Client::builder(TokioExecutor::new()).build(connector))
}

/// Send `request` and collect at most `body_limit` bytes of the response,
/// all within `timeout`.
///
/// # Errors
/// Returns `Timeout` when the deadline passes, `Transport` for connection
/// failures, `TooLarge` past `body_limit` and `Body` when the response body
/// cannot be read.
pub async fn send(
    client: &HttpsClient,
    request: Request<Full<Bytes>>,
    timeout: Duration,
    body_limit: usize,
) -> Result<Response<Bytes>, HttpClientError> {
    let exchange = async {
        let response = client
            .request(request)
            .await
            .map_err(|e| HttpClientError::Transport(e.to_string()))?;
        let (parts, body) = response.into_parts();
        let body = Limited::new(body, body_limit)
            .collect()
            .await
            .map_err(|e| {
                if e.downcast_ref::<LengthLimitError>().is_some() {
                    HttpClientError::TooLarge(body_limit)
                } else {
                    HttpClientError::Body(e.to_string())
                }
            })?
            .to_bytes();
        Ok(Response::from_parts(parts, body))
    };

    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| HttpClientError::Timeout(timeout))?
}
