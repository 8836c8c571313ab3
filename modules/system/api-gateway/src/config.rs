use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Yaml};
use mlops_security::RoleNames;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ConfigError;

/// Environment variable naming the YAML configuration file.
pub const CONFIG_PATH_ENV: &str = "API_GATEWAY_CONFIG_PATH";
/// Used when neither `--config` nor `API_GATEWAY_CONFIG_PATH` is given.
pub const DEFAULT_CONFIG_PATH: &str = "config/api-gateway.yaml";

/// Environment overrides applied on top of the file baseline (env always wins).
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("ENTRA_TENANT_ID", "entra_id.tenant_id"),
    ("ENTRA_CLIENT_ID", "entra_id.client_id"),
    ("ENTRA_CLIENT_SECRET", "entra_id.client_secret"),
    ("ENTRA_AUDIENCE", "entra_id.audience"),
    ("API_GATEWAY_PORT", "server.port"),
    ("MLFLOW_URL", "upstreams.mlflow"),
    ("FEAST_URL", "upstreams.feast"),
    ("OAUTH_REDIRECT_URI", "entra_id.redirect_uri"),
];

pub const MLFLOW_SERVICE: &str = "mlflow";
pub const FEAST_SERVICE: &str = "feast";

fn default_upstreams() -> BTreeMap<String, String> {
    BTreeMap::from([
        (MLFLOW_SERVICE.to_owned(), "http://mlflow:5000".to_owned()),
        (FEAST_SERVICE.to_owned(), "http://feast:6566".to_owned()),
    ])
}

/// Gateway configuration, loaded once at process start and immutable afterwards.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub entra_id: EntraIdConfig,

    /// Upstream service name -> base URL.
    #[serde(default = "default_upstreams")]
    pub upstreams: BTreeMap<String, String>,

    #[serde(default)]
    pub proxy: ProxyConfig,

    #[serde(default)]
    pub security: SecurityConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            entra_id: EntraIdConfig::default(),
            upstreams: default_upstreams(),
            proxy: ProxyConfig::default(),
            security: SecurityConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Whole-request deadline enforced by the timeout layer.
    pub request_timeout_secs: u64,
    /// Global request body size limit in bytes
    pub body_limit_bytes: usize,
    pub enable_docs: bool,
    pub cors_enabled: bool,
    /// Optional detailed CORS configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cors: Option<CorsConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            port: 8080,
            request_timeout_secs: 60,
            body_limit_bytes: 16 * 1024 * 1024,
            enable_docs: true,
            cors_enabled: false,
            cors: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct CorsConfig {
    /// Allowed origins: `["*"]` means any
    pub allowed_origins: Vec<String>,
    /// Whether to allow credentials
    pub allow_credentials: bool,
    /// Max age for preflight caching in seconds
    pub max_age_seconds: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["*".to_owned()],
            allow_credentials: false,
            max_age_seconds: 600,
        }
    }
}

/// Identity provider (Microsoft Entra ID) settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct EntraIdConfig {
    pub tenant_id: String,
    pub client_id: String,
    #[serde(
        deserialize_with = "deserialize_secret",
        serialize_with = "serialize_redacted"
    )]
    pub client_secret: SecretString,
    /// Base URL of the identity provider; the tenant is appended to form the authority.
    pub authority_host: String,
    /// Expected `aud` claim.
    pub audience: String,
    /// Additional accepted `aud` values (e.g. the bare client id next to `api://...`).
    pub extra_audiences: Vec<String>,
    /// Additional accepted `iss` values.
    pub extra_issuers: Vec<String>,
    pub scopes: Vec<String>,
    /// Accepted JWS algorithms.
    pub algorithms: Vec<String>,
    pub redirect_uri: String,
    /// Overrides the key-set URL derived from the tenant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwks_uri: Option<String>,
}

impl Default for EntraIdConfig {
    fn default() -> Self {
        Self {
            tenant_id: String::new(),
            client_id: String::new(),
            client_secret: SecretString::from(String::new()),
            authority_host: "https://login.microsoftonline.com".to_owned(),
            audience: String::new(),
            extra_audiences: Vec::new(),
            extra_issuers: Vec::new(),
            scopes: vec!["openid".to_owned(), "profile".to_owned(), "email".to_owned()],
            algorithms: vec!["RS256".to_owned()],
            redirect_uri: "http://localhost:8081/oauth/callback".to_owned(),
            jwks_uri: None,
        }
    }
}

impl EntraIdConfig {
    /// `{authority_host}/{tenant_id}`
    #[must_use]
    pub fn authority(&self) -> String {
        format!(
            "{}/{}",
            self.authority_host.trim_end_matches('/'),
            self.tenant_id
        )
    }

    /// Signing-key discovery URL.
    #[must_use]
    pub fn jwks_uri(&self) -> String {
        self.jwks_uri
            .clone()
            .unwrap_or_else(|| format!("{}/discovery/v2.0/keys", self.authority()))
    }

    #[must_use]
    pub fn authorize_endpoint(&self) -> String {
        format!("{}/oauth2/v2.0/authorize", self.authority())
    }

    #[must_use]
    pub fn token_endpoint(&self) -> String {
        format!("{}/oauth2/v2.0/token", self.authority())
    }

    /// v2 issuer, v1 issuer, then configured extras.
    #[must_use]
    pub fn issuers(&self) -> Vec<String> {
        let mut issuers = vec![
            format!("{}/v2.0", self.authority()),
            format!("https://sts.windows.net/{}/", self.tenant_id),
        ];
        issuers.extend(self.extra_issuers.iter().cloned());
        issuers
    }

    #[must_use]
    pub fn audiences(&self) -> Vec<String> {
        let mut audiences = vec![self.audience.clone()];
        audiences.extend(self.extra_audiences.iter().cloned());
        audiences
    }

    /// Parsed `algorithms`.
    ///
    /// # Errors
    /// Returns `ConfigError::Fatal` for an empty list or an unknown algorithm name.
    pub fn parsed_algorithms(&self) -> Result<Vec<jsonwebtoken::Algorithm>, ConfigError> {
        if self.algorithms.is_empty() {
            return Err(ConfigError::fatal("entra_id.algorithms must not be empty"));
        }
        self.algorithms
            .iter()
            .map(|name| {
                jsonwebtoken::Algorithm::from_str(name).map_err(|e| {
                    ConfigError::fatal(format!("entra_id.algorithms: invalid '{name}': {e}"))
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct ProxyConfig {
    /// Upper bound for a single upstream call.
    pub timeout_secs: u64,
    /// Forward the subject's last stored session token instead of the token
    /// presented with the current request.
    pub reattach_session_token: bool,
    /// Largest upstream response body relayed to the client.
    pub max_response_bytes: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            reattach_session_token: false,
            max_response_bytes: crate::proxy::DEFAULT_RESPONSE_LIMIT,
        }
    }
}

impl ProxyConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct SecurityConfig {
    pub roles: RoleNames,
    /// Local lifetime of a session entry, independent of the token's own expiry.
    pub session_ttl_secs: u64,
    pub key_fetch_timeout_secs: u64,
    pub key_refresh_interval_secs: u64,
    /// Minimum spacing between two key-set fetches; unknown key ids seen
    /// inside this window are rejected without contacting the provider.
    pub key_min_refresh_interval_secs: u64,
    /// Clock skew tolerated for `exp` / `nbf`. Zero means tokens stop
    /// verifying at their exact expiry.
    pub leeway_secs: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            roles: RoleNames::default(),
            session_ttl_secs: 3600,
            key_fetch_timeout_secs: 5,
            key_refresh_interval_secs: 3600,
            key_min_refresh_interval_secs: 30,
            leeway_secs: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct LoggingConfig {
    /// Default `EnvFilter` directive when `RUST_LOG` is unset.
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            json: false,
        }
    }
}

impl GatewayConfig {
    /// Load the configuration: defaults, then the YAML file, then environment overrides.
    ///
    /// `path` wins over `API_GATEWAY_CONFIG_PATH`, which wins over the default path.
    /// An explicitly named file must exist; the default file is optional.
    ///
    /// # Errors
    /// Returns `ConfigError::Fatal` if the file is missing or malformed, or if the
    /// resulting configuration fails [`GatewayConfig::validate`].
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let explicit = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from));

        let mut figment = Figment::new();
        match explicit {
            Some(path) if !path.exists() => {
                return Err(ConfigError::fatal(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            Some(path) => figment = figment.merge(Yaml::file(path)),
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_PATH);
                if default_path.exists() {
                    figment = figment.merge(Yaml::file(default_path));
                }
            }
        }

        for &(var, key) in ENV_OVERRIDES {
            figment = figment.merge(Env::raw().only(&[var]).map(move |_| key.into()));
        }

        let config: Self = figment
            .extract()
            .map_err(|e| ConfigError::fatal(format!("failed to parse configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every value needed to serve requests is present and well-formed.
    ///
    /// # Errors
    /// Returns `ConfigError::Fatal` naming the first offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("entra_id.tenant_id", &self.entra_id.tenant_id),
            ("entra_id.client_id", &self.entra_id.client_id),
            ("entra_id.audience", &self.entra_id.audience),
        ];
        for (key, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::fatal(format!("{key} must be set")));
            }
        }

        if self.server.port == 0 {
            return Err(ConfigError::fatal("server.port must not be 0"));
        }

        self.entra_id.parsed_algorithms()?;

        for (name, base) in &self.upstreams {
            let parsed = url::Url::parse(base)
                .map_err(|e| ConfigError::fatal(format!("upstreams.{name}: '{base}': {e}")))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(ConfigError::fatal(format!(
                    "upstreams.{name}: unsupported scheme '{}'",
                    parsed.scheme()
                )));
            }
        }

        Ok(())
    }

    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
where
    D: Deserializer<'de>,
{
    String::deserialize(deserializer).map(SecretString::from)
}

fn serialize_redacted<S>(secret: &SecretString, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    if secret.expose_secret().is_empty() {
        serializer.serialize_str("")
    } else {
        serializer.serialize_str("[REDACTED]")
    }
}
