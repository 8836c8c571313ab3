//! Permission engine: explicit per-resource grants layered over global role claims.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use mlops_security::{ADMIN_PERMISSION, Identity, Permission, RoleNames};
use serde::Serialize;
use utoipa::ToSchema;

/// Administrator-set override of role-based access for one subject on one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct ResourceGrant {
    pub resource_id: String,
    pub subject_id: String,
    pub permissions: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
}

impl ResourceGrant {
    #[must_use]
    pub fn allows(&self, action: Permission) -> bool {
        self.permissions.contains(action.as_str()) || self.permissions.contains(ADMIN_PERMISSION)
    }
}

/// Concurrent grant table keyed by `(subject_id, resource_id)`.
#[derive(Debug, Clone, Default)]
pub struct GrantTable {
    grants: Arc<DashMap<(String, String), ResourceGrant>>,
}

impl GrantTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or overwrite the grant for `(subject_id, resource_id)`.
    pub fn set<I, S>(&self, subject_id: &str, resource_id: &str, permissions: I) -> ResourceGrant
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let grant = ResourceGrant {
            resource_id: resource_id.to_owned(),
            subject_id: subject_id.to_owned(),
            permissions: permissions.into_iter().map(Into::into).collect(),
            created_at: Utc::now(),
        };
        self.grants.insert(
            (subject_id.to_owned(), resource_id.to_owned()),
            grant.clone(),
        );
        grant
    }

    #[must_use]
    pub fn get(&self, subject_id: &str, resource_id: &str) -> Option<ResourceGrant> {
        self.grants
            .get(&(subject_id.to_owned(), resource_id.to_owned()))
            .map(|e| e.value().clone())
    }

    /// All grants on a resource, ordered by subject.
    #[must_use]
    pub fn list_for_resource(&self, resource_id: &str) -> Vec<ResourceGrant> {
        let mut grants: Vec<_> = self
            .grants
            .iter()
            .filter(|e| e.value().resource_id == resource_id)
            .map(|e| e.value().clone())
            .collect();
        grants.sort_by(|a, b| a.subject_id.cmp(&b.subject_id));
        grants
    }

    /// All grants held by a subject, ordered by resource.
    #[must_use]
    pub fn list_for_subject(&self, subject_id: &str) -> Vec<ResourceGrant> {
        let mut grants: Vec<_> = self
            .grants
            .iter()
            .filter(|e| e.value().subject_id == subject_id)
            .map(|e| e.value().clone())
            .collect();
        grants.sort_by(|a, b| a.resource_id.cmp(&b.resource_id));
        grants
    }
}

/// Role-derived capabilities of an identity, independent of any resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
pub struct EffectivePermissions {
    pub read: bool,
    pub write: bool,
    pub admin: bool,
}

/// Decides whether an identity may perform an action on a resource.
#[derive(Debug, Clone)]
pub struct PermissionEngine {
    grants: GrantTable,
    roles: RoleNames,
}

impl PermissionEngine {
    #[must_use]
    pub fn new(grants: GrantTable, roles: RoleNames) -> Self {
        Self { grants, roles }
    }

    #[must_use]
    pub fn grants(&self) -> &GrantTable {
        &self.grants
    }

    #[must_use]
    pub fn roles(&self) -> &RoleNames {
        &self.roles
    }

    /// An explicit grant for `(subject, resource)` is authoritative; otherwise
    /// the global roles decide. Resource ids are matched exactly.
    #[must_use]
    pub fn authorize(&self, identity: &Identity, resource_id: &str, action: Permission) -> bool {
        if let Some(grant) = self.grants.get(identity.subject_id(), resource_id) {
            let allowed = grant.allows(action);
            tracing::debug!(
                subject_id = %identity.subject_id(),
                resource_id = %resource_id,
                action = %action,
                allowed,
                "Resolved by explicit grant"
            );
            return allowed;
        }
        self.authorize_global(identity, action)
    }

    /// Role-only evaluation, used where no specific resource is named.
    #[must_use]
    pub fn authorize_global(&self, identity: &Identity, action: Permission) -> bool {
        if identity.has_role(&self.roles.admin) {
            return true;
        }
        if identity.has_role(&self.roles.write) {
            return matches!(action, Permission::Read | Permission::Write);
        }
        if identity.has_role(&self.roles.read) {
            return action == Permission::Read;
        }
        false
    }

    #[must_use]
    pub fn is_admin(&self, identity: &Identity) -> bool {
        identity.has_role(&self.roles.admin)
    }

    #[must_use]
    pub fn effective_permissions(&self, identity: &Identity) -> EffectivePermissions {
        EffectivePermissions {
            read: self.authorize_global(identity, Permission::Read),
            write: self.authorize_global(identity, Permission::Write),
            admin: self.authorize_global(identity, Permission::Admin),
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    const ALL_ACTIONS: [Permission; 3] = [Permission::Read, Permission::Write, Permission::Admin];

    fn engine() -> PermissionEngine {
        PermissionEngine::new(GrantTable::new(), RoleNames::default())
    }

    fn identity(subject: &str, roles: &[&str]) -> Identity {
        Identity::builder()
            .subject_id(subject)
            .roles(roles.iter().copied())
            .build()
    }

    #[test]
    fn grant_overrides_missing_roles() {
        let engine = engine();
        let user = identity("user-1", &[]);
        engine.grants().set("user-1", "42", ["read"]);

        assert!(engine.authorize(&user, "42", Permission::Read));
        assert!(!engine.authorize(&user, "42", Permission::Write));
    }

    #[test]
    fn grant_overrides_admin_role() {
        let engine = engine();
        let admin = identity("user-1", &["mlflow:admin"]);
        engine.grants().set("user-1", "42", ["read"]);

        assert!(!engine.authorize(&admin, "42", Permission::Write));
        // Other resources still fall back to the role.
        assert!(engine.authorize(&admin, "43", Permission::Write));
    }

    #[test]
    fn admin_entry_in_grant_allows_everything() {
        let engine = engine();
        let user = identity("user-1", &[]);
        engine.grants().set("user-1", "42", [ADMIN_PERMISSION]);

        for action in ALL_ACTIONS {
            assert!(engine.authorize(&user, "42", action));
        }
    }

    #[test]
    fn empty_grant_denies_everything() {
        let engine = engine();
        let writer = identity("user-1", &["mlflow:write"]);
        engine.grants().set("user-1", "42", Vec::<String>::new());

        for action in ALL_ACTIONS {
            assert!(!engine.authorize(&writer, "42", action));
        }
    }

    #[test]
    fn admin_role_allows_every_action_without_grant() {
        let engine = engine();
        let admin = identity("root", &["mlflow:admin"]);

        for resource in ["1", "42", "experiment-x"] {
            for action in ALL_ACTIONS {
                assert!(engine.authorize(&admin, resource, action));
            }
        }
    }

    #[test]
    fn write_role_allows_read_and_write_only() {
        let engine = engine();
        let writer = identity("w", &["mlflow:write"]);

        assert!(engine.authorize(&writer, "42", Permission::Read));
        assert!(engine.authorize(&writer, "42", Permission::Write));
        assert!(!engine.authorize(&writer, "42", Permission::Admin));
    }

    #[test]
    fn read_role_allows_read_only() {
        let engine = engine();
        let reader = identity("r", &["mlflow:read"]);

        assert!(engine.authorize(&reader, "42", Permission::Read));
        assert!(!engine.authorize(&reader, "42", Permission::Write));
    }

    #[test]
    fn no_roles_no_grant_denies() {
        let engine = engine();
        let nobody = identity("n", &["unrelated:role"]);

        for action in ALL_ACTIONS {
            assert!(!engine.authorize(&nobody, "42", action));
        }
    }

    #[test]
    fn resource_ids_match_exactly() {
        let engine = engine();
        let user = identity("user-1", &[]);
        engine.grants().set("user-1", "4", ["read"]);

        assert!(!engine.authorize(&user, "42", Permission::Read));
        assert!(!engine.authorize(&user, "*", Permission::Read));
    }

    #[test]
    fn grant_updates_are_visible_immediately() {
        let engine = engine();
        let user = identity("user-1", &[]);

        engine.grants().set("user-1", "42", ["read"]);
        assert!(!engine.authorize(&user, "42", Permission::Write));

        engine.grants().set("user-1", "42", ["read", "write"]);
        assert!(engine.authorize(&user, "42", Permission::Write));
    }

    #[test]
    fn configured_role_names_are_honoured() {
        let roles = RoleNames {
            admin: "admin".to_owned(),
            write: "write".to_owned(),
            read: "read".to_owned(),
        };
        let engine = PermissionEngine::new(GrantTable::new(), roles);

        assert!(engine.authorize(&identity("u", &["read"]), "42", Permission::Read));
        assert!(!engine.authorize(&identity("u", &["read"]), "42", Permission::Write));
        assert!(!engine.authorize(&identity("u", &["mlflow:admin"]), "42", Permission::Read));
    }

    #[test]
    fn effective_permissions_follow_roles() {
        let engine = engine();

        let perms = engine.effective_permissions(&identity("w", &["mlflow:write"]));
        assert_eq!(
            perms,
            EffectivePermissions {
                read: true,
                write: true,
                admin: false
            }
        );
    }

    #[test]
    fn list_grants_by_resource_and_subject() {
        let grants = GrantTable::new();
        grants.set("b", "42", ["read"]);
        grants.set("a", "42", ["write"]);
        grants.set("a", "7", ["read"]);

        let on_42: Vec<_> = grants
            .list_for_resource("42")
            .into_iter()
            .map(|g| g.subject_id)
            .collect();
        assert_eq!(on_42, vec!["a", "b"]);

        let for_a: Vec<_> = grants
            .list_for_subject("a")
            .into_iter()
            .map(|g| g.resource_id)
            .collect();
        assert_eq!(for_a, vec!["42", "7"]);
    }
}
