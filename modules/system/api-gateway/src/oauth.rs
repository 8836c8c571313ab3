//! Authorization-code boundary with the identity provider.
//!
//! The gateway only builds the redirect URL and relays the code exchange;
//! tokens obtained here are verified like any other on later requests.

use std::time::Duration;

use axum::Json;
use axum::extract::{Query, State};
use axum::http::{Method, Request, StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use bytes::Bytes;
use http_body_util::Full;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;
use utoipa::{IntoParams, ToSchema};

use crate::config::EntraIdConfig;
use crate::error::GatewayError;
use crate::http_client::{self, HttpsClient};
use crate::module::GatewayState;

#[derive(Clone)]
pub struct OAuthClient {
    client_id: String,
    client_secret: SecretString,
    authorize_endpoint: String,
    token_endpoint: String,
    scopes: Vec<String>,
    redirect_uri: String,
    http: HttpsClient,
    timeout: Duration,
}

impl std::fmt::Debug for OAuthClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthClient")
            .field("client_id", &self.client_id)
            .field("token_endpoint", &self.token_endpoint)
            .field("redirect_uri", &self.redirect_uri)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Serialize)]
struct TokenRequestForm<'a> {
    client_id: &'a str,
    client_secret: &'a str,
    code: &'a str,
    redirect_uri: &'a str,
    grant_type: &'static str,
}

impl OAuthClient {
    #[must_use]
    pub fn new(entra: &EntraIdConfig, http: HttpsClient, timeout: Duration) -> Self {
        Self {
            client_id: entra.client_id.clone(),
            client_secret: entra.client_secret.clone(),
            authorize_endpoint: entra.authorize_endpoint(),
            token_endpoint: entra.token_endpoint(),
            scopes: entra.scopes.clone(),
            redirect_uri: entra.redirect_uri.clone(),
            http,
            timeout,
        }
    }

    #[must_use]
    pub fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }

    /// Identity-provider URL the browser is sent to.
    ///
    /// # Errors
    /// Fails when the configured authority does not form a valid URL.
    pub fn authorization_url(&self) -> Result<Url, url::ParseError> {
        let scope = self.scopes.join(" ");
        Url::parse_with_params(
            &self.authorize_endpoint,
            [
                ("client_id", self.client_id.as_str()),
                ("response_type", "code"),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("scope", scope.as_str()),
                ("response_mode", "query"),
            ],
        )
    }

    /// Exchange an authorization code for the provider's token payload.
    ///
    /// # Errors
    /// `BadRequest` for any failure; the reason is logged, never returned.
    pub async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<Value, GatewayError> {
        let failed = || GatewayError::bad_request("Token exchange failed");

        let form = serde_urlencoded::to_string(TokenRequestForm {
            client_id: &self.client_id,
            client_secret: self.client_secret.expose_secret(),
            code,
            redirect_uri,
            grant_type: "authorization_code",
        })
        .map_err(|e| GatewayError::internal(format!("token request encoding: {e}")))?;

        let request = Request::builder()
            .method(Method::POST)
            .uri(&self.token_endpoint)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(header::ACCEPT, "application/json")
            .body(Full::new(Bytes::from(form)))
            .map_err(|e| GatewayError::internal(format!("token request: {e}")))?;

        let response = http_client::send(
            &self.http,
            request,
            self.timeout,
            http_client::IDENTITY_PROVIDER_BODY_LIMIT,
        )
            .await
            .map_err(|e| {
                tracing::error!("Token exchange failed: {e}");
                failed()
            })?;

        if !response.status().is_success() {
            tracing::error!(status = %response.status(), "Token exchange rejected by identity provider");
            return Err(failed());
        }

        serde_json::from_slice(response.body()).map_err(|e| {
            tracing::error!("Token exchange returned invalid JSON: {e}");
            failed()
        })
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AuthorizationUrl {
    pub authorization_url: String,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct TokenExchangeParams {
    pub code: String,
    pub redirect_uri: String,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// Authorization URL for the sign-in redirect.
#[utoipa::path(
    get,
    path = "/oauth/authorize",
    tag = "oauth",
    responses((status = 200, body = AuthorizationUrl))
)]
pub async fn authorize(
    State(state): State<GatewayState>,
) -> Result<Json<AuthorizationUrl>, GatewayError> {
    let url = state
        .oauth
        .authorization_url()
        .map_err(|e| GatewayError::internal(format!("authorization URL: {e}")))?;
    Ok(Json(AuthorizationUrl {
        authorization_url: url.into(),
    }))
}

/// Exchange an authorization code for tokens.
#[utoipa::path(
    post,
    path = "/oauth/token",
    tag = "oauth",
    params(TokenExchangeParams),
    responses(
        (status = 200, description = "Identity-provider token payload"),
        (status = 400, body = crate::problem::Problem)
    )
)]
pub async fn token(
    State(state): State<GatewayState>,
    Query(params): Query<TokenExchangeParams>,
) -> Result<Json<Value>, GatewayError> {
    state
        .oauth
        .exchange_code(&params.code, &params.redirect_uri)
        .await
        .map(Json)
}

/// Browser landing page after sign-in.
#[utoipa::path(
    get,
    path = "/oauth/callback",
    tag = "oauth",
    params(CallbackParams),
    responses(
        (status = 200, description = "Identity-provider token payload"),
        (status = 400, description = "HTML failure page")
    )
)]
pub async fn callback(
    State(state): State<GatewayState>,
    Query(params): Query<CallbackParams>,
) -> Response {
    if let Some(error) = params.error {
        tracing::warn!(
            error = %error,
            description = params.error_description.as_deref().unwrap_or_default(),
            "Identity provider returned an error to the callback"
        );
        return CallbackFailure::from_provider_error(&error).into_response();
    }
    let Some(code) = params.code else {
        return CallbackFailure::MissingCode.into_response();
    };

    let redirect_uri = state.oauth.redirect_uri().to_owned();
    match state.oauth.exchange_code(&code, &redirect_uri).await {
        Ok(tokens) => Json(tokens).into_response(),
        Err(_) => CallbackFailure::ExchangeFailed.into_response(),
    }
}

/// Why the sign-in landing page failed. Each variant renders a fixed page;
/// nothing supplied by the caller or the provider is echoed back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackFailure {
    AccessDenied,
    ProviderError,
    MissingCode,
    ExchangeFailed,
}

impl CallbackFailure {
    #[must_use]
    pub fn from_provider_error(code: &str) -> Self {
        match code {
            "access_denied" | "consent_required" | "interaction_required" => Self::AccessDenied,
            _ => Self::ProviderError,
        }
    }

    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::AccessDenied => "Sign-in was cancelled or access was denied.",
            Self::ProviderError => "The identity provider reported an error.",
            Self::MissingCode => "No authorization code received.",
            Self::ExchangeFailed => "Token exchange failed.",
        }
    }
}

impl IntoResponse for CallbackFailure {
    fn into_response(self) -> Response {
        let body = format!(
            "<!DOCTYPE html>\n<html>\n<head><title>Sign-in failed</title></head>\n<body>\n\
             <h1>Sign-in failed</h1>\n<p>{}</p>\n</body>\n</html>\n",
            self.message()
        );
        (StatusCode::BAD_REQUEST, Html(body)).into_response()
    }
}
