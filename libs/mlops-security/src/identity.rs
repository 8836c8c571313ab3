use std::collections::BTreeSet;

use secrecy::SecretString;

/// `Identity` is the verified caller of a single request.
///
/// Built by the token verifier from the claims of a bearer token that passed
/// signature, issuer, audience and lifetime checks in the current request.
/// It is never cached across requests.
#[derive(Debug, Clone, Default)]
pub struct Identity {
    /// Stable subject identifier (object id, else generic subject claim).
    subject_id: String,
    /// Email address, falling back to the preferred username.
    email: String,
    /// Human readable display name.
    display_name: String,
    /// Directory group memberships.
    groups: BTreeSet<String>,
    /// Application role claims, e.g. `mlflow:write`.
    roles: BTreeSet<String>,
    /// The bearer token this identity was derived from.
    /// Wrapped in `SecretString` so `Debug` redacts the value automatically.
    bearer_token: Option<SecretString>,
}

impl Identity {
    #[must_use]
    pub fn builder() -> IdentityBuilder {
        IdentityBuilder::default()
    }

    #[must_use]
    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    #[must_use]
    pub fn email(&self) -> &str {
        &self.email
    }

    #[must_use]
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    #[must_use]
    pub fn groups(&self) -> &BTreeSet<String> {
        &self.groups
    }

    #[must_use]
    pub fn roles(&self) -> &BTreeSet<String> {
        &self.roles
    }

    /// Whether the identity carries the given role claim.
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    /// The token presented in the current request.
    #[must_use]
    pub fn bearer_token(&self) -> Option<&SecretString> {
        self.bearer_token.as_ref()
    }

    /// Attach the token this identity was verified from.
    #[must_use]
    pub fn with_bearer_token(mut self, token: impl Into<SecretString>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    /// Comma-joined group list, as injected into upstream headers.
    #[must_use]
    pub fn groups_header(&self) -> String {
        join(&self.groups)
    }

    /// Comma-joined role list, as injected into upstream headers.
    #[must_use]
    pub fn roles_header(&self) -> String {
        join(&self.roles)
    }
}

fn join(values: &BTreeSet<String>) -> String {
    values
        .iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(",")
}

#[derive(Default)]
pub struct IdentityBuilder {
    subject_id: Option<String>,
    email: Option<String>,
    display_name: Option<String>,
    groups: BTreeSet<String>,
    roles: BTreeSet<String>,
    bearer_token: Option<SecretString>,
}

impl IdentityBuilder {
    #[must_use]
    pub fn subject_id(mut self, subject_id: impl Into<String>) -> Self {
        self.subject_id = Some(subject_id.into());
        self
    }

    #[must_use]
    pub fn email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    #[must_use]
    pub fn display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    #[must_use]
    pub fn groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn bearer_token(mut self, token: impl Into<SecretString>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    #[must_use]
    pub fn build(self) -> Identity {
        Identity {
            subject_id: self.subject_id.unwrap_or_default(),
            email: self.email.unwrap_or_default(),
            display_name: self.display_name.unwrap_or_default(),
            groups: self.groups,
            roles: self.roles,
            bearer_token: self.bearer_token,
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use secrecy::ExposeSecret;

    use super::*;

    #[test]
    fn test_identity_builder_full() {
        let identity = Identity::builder()
            .subject_id("56c58a6a-75c9-469c-be5e-e4ca81c95561")
            .email("ada@example.com")
            .display_name("Ada Lovelace")
            .groups(["data-science", "platform"])
            .roles(["mlflow:read", "mlflow:write"])
            .bearer_token("test-token-123".to_owned())
            .build();

        assert_eq!(identity.subject_id(), "56c58a6a-75c9-469c-be5e-e4ca81c95561");
        assert_eq!(identity.email(), "ada@example.com");
        assert_eq!(identity.display_name(), "Ada Lovelace");
        assert!(identity.has_role("mlflow:write"));
        assert!(!identity.has_role("mlflow:admin"));
        assert_eq!(
            identity.bearer_token().map(ExposeSecret::expose_secret),
            Some("test-token-123"),
        );
    }

    #[test]
    fn test_identity_builder_minimal() {
        let identity = Identity::builder().build();

        assert!(identity.subject_id().is_empty());
        assert!(identity.groups().is_empty());
        assert!(identity.roles().is_empty());
        assert!(identity.bearer_token().is_none());
    }

    #[test]
    fn test_header_lists_are_comma_joined_and_sorted() {
        let identity = Identity::builder()
            .groups(["platform", "data-science"])
            .roles(["mlflow:write", "mlflow:read"])
            .build();

        assert_eq!(identity.groups_header(), "data-science,platform");
        assert_eq!(identity.roles_header(), "mlflow:read,mlflow:write");
        assert_eq!(Identity::builder().build().roles_header(), "");
    }

    #[test]
    fn test_debug_redacts_token() {
        let identity = Identity::builder()
            .bearer_token("very-secret".to_owned())
            .build();

        assert!(!format!("{identity:?}").contains("very-secret"));
    }
}
