//! Identity extraction from verified token claims.
//!
//! Each identity field is resolved through an ordered chain of claim names;
//! the first claim that is present (and non-empty) wins.

use std::collections::BTreeSet;

use mlops_security::Identity;
use serde_json::{Map, Value};

use crate::error::AuthError;

pub type Claims = Map<String, Value>;

/// Reads one claim value into the field's representation.
type Extractor<T> = fn(&Value) -> Option<T>;

/// Ordered `(claim name, extractor)` pairs for one identity field.
pub struct ClaimChain<T: 'static> {
    links: &'static [(&'static str, Extractor<T>)],
}

impl<T: 'static> ClaimChain<T> {
    #[must_use]
    pub const fn new(links: &'static [(&'static str, Extractor<T>)]) -> Self {
        Self { links }
    }

    /// First value produced by the chain, with the claim it came from.
    #[must_use]
    pub fn resolve(&self, claims: &Claims) -> Option<(&'static str, T)> {
        self.links.iter().find_map(|(name, extract)| {
            claims
                .get(*name)
                .and_then(extract)
                .map(|value| (*name, value))
        })
    }
}

fn non_empty_string(value: &Value) -> Option<String> {
    value
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}

/// Accepts a JSON array of strings, or a single space/comma separated string.
fn string_set(value: &Value) -> Option<BTreeSet<String>> {
    match value {
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(non_empty_string)
                .collect(),
        ),
        Value::String(s) => Some(
            s.split([',', ' '])
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_owned)
                .collect(),
        ),
        _ => None,
    }
}

pub static SUBJECT: ClaimChain<String> =
    ClaimChain::new(&[("oid", non_empty_string), ("sub", non_empty_string)]);

pub static EMAIL: ClaimChain<String> = ClaimChain::new(&[
    ("email", non_empty_string),
    ("preferred_username", non_empty_string),
    ("upn", non_empty_string),
]);

pub static DISPLAY_NAME: ClaimChain<String> = ClaimChain::new(&[("name", non_empty_string)]);

pub static GROUPS: ClaimChain<BTreeSet<String>> = ClaimChain::new(&[("groups", string_set)]);

pub static ROLES: ClaimChain<BTreeSet<String>> = ClaimChain::new(&[("roles", string_set)]);

/// Build an [`Identity`] from already verified claims.
///
/// # Errors
/// `AuthError::Malformed` when no subject claim is present.
pub fn identity_from_claims(claims: &Claims) -> Result<Identity, AuthError> {
    let Some((subject_claim, subject_id)) = SUBJECT.resolve(claims) else {
        return Err(AuthError::malformed("token carries no subject claim"));
    };
    tracing::trace!(subject_claim, "Resolved subject");

    let mut builder = Identity::builder().subject_id(subject_id);
    if let Some((_, email)) = EMAIL.resolve(claims) {
        builder = builder.email(email);
    }
    if let Some((_, name)) = DISPLAY_NAME.resolve(claims) {
        builder = builder.display_name(name);
    }
    if let Some((_, groups)) = GROUPS.resolve(claims) {
        builder = builder.groups(groups);
    }
    if let Some((_, roles)) = ROLES.resolve(claims) {
        builder = builder.roles(roles);
    }
    Ok(builder.build())
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use serde_json::json;

    use super::*;

    fn claims(value: Value) -> Claims {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn object_id_preferred_over_subject() {
        let c = claims(json!({"oid": "object-1", "sub": "pairwise-1"}));
        let identity = identity_from_claims(&c).unwrap();
        assert_eq!(identity.subject_id(), "object-1");
    }

    #[test]
    fn subject_used_when_object_id_absent() {
        let c = claims(json!({"sub": "pairwise-1"}));
        assert_eq!(identity_from_claims(&c).unwrap().subject_id(), "pairwise-1");
    }

    #[test]
    fn empty_object_id_falls_through() {
        let c = claims(json!({"oid": "", "sub": "pairwise-1"}));
        assert_eq!(identity_from_claims(&c).unwrap().subject_id(), "pairwise-1");
    }

    #[test]
    fn missing_subject_is_malformed() {
        let c = claims(json!({"email": "a@example.com"}));
        assert!(matches!(
            identity_from_claims(&c),
            Err(AuthError::Malformed(_))
        ));
    }

    #[test]
    fn email_chain_order() {
        let c = claims(json!({"sub": "s", "preferred_username": "pu@x", "upn": "upn@x"}));
        assert_eq!(identity_from_claims(&c).unwrap().email(), "pu@x");

        let c = claims(json!({"sub": "s", "upn": "upn@x"}));
        assert_eq!(identity_from_claims(&c).unwrap().email(), "upn@x");

        let c = claims(json!({"sub": "s", "email": "e@x", "preferred_username": "pu@x"}));
        assert_eq!(identity_from_claims(&c).unwrap().email(), "e@x");
    }

    #[test]
    fn roles_and_groups_are_collected() {
        let c = claims(json!({
            "sub": "s",
            "name": "Ada",
            "roles": ["mlflow:write", "mlflow:read"],
            "groups": ["g2", "g1"]
        }));
        let identity = identity_from_claims(&c).unwrap();
        assert_eq!(identity.display_name(), "Ada");
        assert_eq!(identity.roles_header(), "mlflow:read,mlflow:write");
        assert_eq!(identity.groups_header(), "g1,g2");
    }

    #[test]
    fn space_separated_roles_string_is_split() {
        let c = claims(json!({"sub": "s", "roles": "mlflow:read mlflow:write"}));
        let identity = identity_from_claims(&c).unwrap();
        assert!(identity.has_role("mlflow:read"));
        assert!(identity.has_role("mlflow:write"));
    }

    #[test]
    fn chain_reports_source_claim() {
        let c = claims(json!({"upn": "u@x"}));
        assert_eq!(EMAIL.resolve(&c), Some(("upn", "u@x".to_owned())));
    }
}
