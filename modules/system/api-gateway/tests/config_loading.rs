#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Configuration layering: defaults, YAML file, environment overrides.

use std::io::Write;
use std::path::Path;

use api_gateway::GatewayConfig;
use api_gateway::config::{CONFIG_PATH_ENV, MLFLOW_SERVICE};
use secrecy::ExposeSecret;

const BASE_YAML: &str = r#"
server:
  host: "127.0.0.1"
  port: 9090
  enable_docs: false
entra_id:
  tenant_id: "tenant-from-file"
  client_id: "client-from-file"
  client_secret: "file-secret"
  audience: "api://client-from-file"
upstreams:
  mlflow: "http://mlflow.internal:5000"
  feast: "http://feast.internal:6566"
proxy:
  timeout_secs: 10
  reattach_session_token: true
security:
  roles:
    admin: "platform:admin"
  session_ttl_secs: 900
logging:
  level: "debug"
  json: true
"#;

const OVERRIDE_VARS: [&str; 8] = [
    "ENTRA_TENANT_ID",
    "ENTRA_CLIENT_ID",
    "ENTRA_CLIENT_SECRET",
    "ENTRA_AUDIENCE",
    "API_GATEWAY_PORT",
    "MLFLOW_URL",
    "FEAST_URL",
    "OAUTH_REDIRECT_URI",
];

fn write_yaml(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

/// Run `f` with every override variable unset plus `vars` set.
fn with_env<R>(vars: &[(&str, &str)], f: impl FnOnce() -> R) -> R {
    let mut all: Vec<(&str, Option<&str>)> = OVERRIDE_VARS.iter().map(|v| (*v, None)).collect();
    all.push((CONFIG_PATH_ENV, None));
    for (key, value) in vars {
        all.retain(|(k, _)| k != key);
        all.push((*key, Some(*value)));
    }
    temp_env::with_vars(all, f)
}

#[test]
fn file_values_are_loaded() {
    let file = write_yaml(BASE_YAML);

    let cfg = with_env(&[], || GatewayConfig::load(Some(file.path()))).unwrap();

    assert_eq!(cfg.bind_addr(), "127.0.0.1:9090");
    assert!(!cfg.server.enable_docs);
    assert_eq!(cfg.entra_id.tenant_id, "tenant-from-file");
    assert_eq!(cfg.entra_id.client_secret.expose_secret(), "file-secret");
    assert_eq!(cfg.upstreams[MLFLOW_SERVICE], "http://mlflow.internal:5000");
    assert_eq!(cfg.proxy.timeout_secs, 10);
    assert!(cfg.proxy.reattach_session_token);
    assert_eq!(cfg.security.roles.admin, "platform:admin");
    assert_eq!(cfg.security.roles.read, "mlflow:read");
    assert_eq!(cfg.security.session_ttl_secs, 900);
    assert_eq!(cfg.logging.level, "debug");
    assert!(cfg.logging.json);
}

#[test]
fn environment_overrides_file() {
    let file = write_yaml(BASE_YAML);

    let cfg = with_env(
        &[
            ("ENTRA_TENANT_ID", "tenant-from-env"),
            ("ENTRA_CLIENT_SECRET", "env-secret"),
            ("API_GATEWAY_PORT", "8181"),
            ("MLFLOW_URL", "http://mlflow.override:5000"),
            ("OAUTH_REDIRECT_URI", "https://gw.example.test/oauth/callback"),
        ],
        || GatewayConfig::load(Some(file.path())),
    )
    .unwrap();

    assert_eq!(cfg.entra_id.tenant_id, "tenant-from-env");
    assert_eq!(cfg.entra_id.client_secret.expose_secret(), "env-secret");
    assert_eq!(cfg.server.port, 8181);
    assert_eq!(cfg.upstreams[MLFLOW_SERVICE], "http://mlflow.override:5000");
    assert_eq!(cfg.upstreams["feast"], "http://feast.internal:6566");
    assert_eq!(
        cfg.entra_id.redirect_uri,
        "https://gw.example.test/oauth/callback"
    );
    // Untouched keys keep their file value.
    assert_eq!(cfg.entra_id.client_id, "client-from-file");
}

#[test]
fn config_path_env_is_used_when_no_path_given() {
    let file = write_yaml(BASE_YAML);
    let path = file.path().to_str().unwrap().to_owned();

    let cfg = with_env(&[(CONFIG_PATH_ENV, path.as_str())], || GatewayConfig::load(None)).unwrap();

    assert_eq!(cfg.entra_id.tenant_id, "tenant-from-file");
}

#[test]
fn environment_alone_is_sufficient() {
    let cfg = with_env(
        &[
            ("ENTRA_TENANT_ID", "t"),
            ("ENTRA_CLIENT_ID", "c"),
            ("ENTRA_AUDIENCE", "api://c"),
        ],
        || GatewayConfig::load(Some(write_yaml("{}").path())),
    )
    .unwrap();

    assert_eq!(cfg.server.port, 8080);
    assert_eq!(cfg.upstreams[MLFLOW_SERVICE], "http://mlflow:5000");
    assert_eq!(cfg.entra_id.scopes, vec!["openid", "profile", "email"]);
}

#[test]
fn missing_explicit_file_is_fatal() {
    let err = with_env(&[], || {
        GatewayConfig::load(Some(Path::new("/definitely/not/here.yaml")))
    })
    .unwrap_err();

    assert!(err.to_string().contains("config file not found"), "{err}");
}

#[test]
fn missing_required_value_is_fatal() {
    let file = write_yaml(
        r#"
entra_id:
  client_id: "c"
  audience: "api://c"
"#,
    );

    let err = with_env(&[], || GatewayConfig::load(Some(file.path()))).unwrap_err();

    assert!(err.to_string().contains("entra_id.tenant_id"), "{err}");
}

#[test]
fn unknown_keys_are_rejected() {
    let file = write_yaml(
        r#"
entra_id:
  tenant_id: "t"
  client_id: "c"
  audience: "api://c"
  tennant_id: "typo"
"#,
    );

    let err = with_env(&[], || GatewayConfig::load(Some(file.path()))).unwrap_err();

    assert!(err.to_string().contains("failed to parse configuration"), "{err}");
}

#[test]
fn non_numeric_port_override_is_fatal() {
    let file = write_yaml(BASE_YAML);

    let result = with_env(&[("API_GATEWAY_PORT", "eighty")], || {
        GatewayConfig::load(Some(file.path()))
    });

    assert!(result.is_err());
}
