//! MLOps API gateway.
//!
//! Request pipeline, outermost first:
//! set request id -> propagate request id -> trace -> push request id to extensions
//! -> timeout -> body limit -> CORS -> authentication (public-path bypass, token
//! verification) -> router (authorize -> route -> forward).
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod auth;
pub mod config;
pub mod cors;
pub mod error;
pub mod handlers;
pub mod http_client;
pub mod middleware;
pub mod module;
pub mod oauth;
pub mod permissions;
pub mod problem;
pub mod proxy;
pub mod router;
pub mod session;
pub mod verifier;
pub mod web;

pub use config::GatewayConfig;
pub use error::{AuthError, AuthzError, ConfigError, GatewayError, ProxyError};
pub use module::{ApiGateway, GatewayState};
pub use permissions::{GrantTable, PermissionEngine, ResourceGrant};
pub use session::{Session, SessionStore};
pub use verifier::{JwksCache, JwtTokenVerifier, JwtValidationSettings, TokenVerifier};
