#![allow(clippy::unwrap_used, clippy::expect_used)]

use mlops_security::{ADMIN_PERMISSION, Permission, RoleNames};

#[test]
fn permission_parses_wire_names() {
    assert_eq!("read".parse::<Permission>().unwrap(), Permission::Read);
    assert_eq!("write".parse::<Permission>().unwrap(), Permission::Write);
    assert_eq!(ADMIN_PERMISSION.parse::<Permission>().unwrap(), Permission::Admin);
    assert!("delete".parse::<Permission>().is_err());
}

#[test]
fn permission_serializes_lowercase() {
    let json = serde_json::to_string(&[Permission::Read, Permission::Admin]).unwrap();
    assert_eq!(json, r#"["read","admin"]"#);
}

#[test]
fn default_role_names_match_mlflow_claims() {
    let roles = RoleNames::default();
    assert_eq!(roles.admin, "mlflow:admin");
    assert_eq!(roles.write, "mlflow:write");
    assert_eq!(roles.read, "mlflow:read");
}

#[test]
fn role_names_fill_missing_fields_from_defaults() {
    let roles: RoleNames = serde_json::from_str(r#"{"admin": "platform:admin"}"#).unwrap();
    assert_eq!(roles.admin, "platform:admin");
    assert_eq!(roles.read, "mlflow:read");
}
