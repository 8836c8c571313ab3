//! Locally served authenticated endpoints: profile and grant administration.

use std::collections::BTreeSet;

use axum::Json;
use axum::extract::{Extension, Path, State};
use mlops_security::{Identity, Permission};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::{AuthzError, GatewayError};
use crate::module::GatewayState;
use crate::permissions::ResourceGrant;

#[derive(Debug, Serialize, ToSchema)]
pub struct ProfilePermissions {
    pub mlflow_read: bool,
    pub mlflow_write: bool,
    pub mlflow_admin: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct UserProfile {
    pub user_id: String,
    pub email: String,
    pub name: String,
    pub groups: BTreeSet<String>,
    pub roles: BTreeSet<String>,
    pub permissions: ProfilePermissions,
    /// Explicit per-experiment grants held by the caller.
    pub grants: Vec<ResourceGrant>,
}

/// The caller's identity and role-derived permissions.
#[utoipa::path(
    get,
    path = "/user/profile",
    tag = "user",
    security(("bearer" = [])),
    responses(
        (status = 200, body = UserProfile),
        (status = 401, body = crate::problem::Problem)
    )
)]
pub async fn user_profile(
    State(state): State<GatewayState>,
    Extension(identity): Extension<Identity>,
) -> Json<UserProfile> {
    let permissions = &state.pipeline.permissions;
    let effective = permissions.effective_permissions(&identity);
    let grants = permissions.grants().list_for_subject(identity.subject_id());
    Json(UserProfile {
        user_id: identity.subject_id().to_owned(),
        email: identity.email().to_owned(),
        name: identity.display_name().to_owned(),
        groups: identity.groups().clone(),
        roles: identity.roles().clone(),
        permissions: ProfilePermissions {
            mlflow_read: effective.read,
            mlflow_write: effective.write,
            mlflow_admin: effective.admin,
        },
        grants,
    })
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct SetPermissionsRequest {
    pub user_id: String,
    /// Any of `read`, `write`, `admin`.
    #[schema(value_type = Vec<String>)]
    pub permissions: Vec<Permission>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SetPermissionsResponse {
    pub message: String,
    pub grant: ResourceGrant,
}

fn require_admin(state: &GatewayState, identity: &Identity) -> Result<(), GatewayError> {
    if state.pipeline.permissions.is_admin(identity) {
        Ok(())
    } else {
        Err(AuthzError::forbidden("Admin access required").into())
    }
}

/// Create or replace a subject's grant on an experiment.
#[utoipa::path(
    post,
    path = "/admin/experiments/{experiment_id}/permissions",
    tag = "admin",
    security(("bearer" = [])),
    params(("experiment_id" = String, Path, description = "Experiment id")),
    request_body = SetPermissionsRequest,
    responses(
        (status = 200, body = SetPermissionsResponse),
        (status = 400, body = crate::problem::Problem),
        (status = 403, body = crate::problem::Problem)
    )
)]
pub async fn set_experiment_permissions(
    State(state): State<GatewayState>,
    Extension(identity): Extension<Identity>,
    Path(experiment_id): Path<String>,
    Json(body): Json<SetPermissionsRequest>,
) -> Result<Json<SetPermissionsResponse>, GatewayError> {
    require_admin(&state, &identity)?;
    if body.user_id.trim().is_empty() {
        return Err(GatewayError::bad_request("user_id must not be empty"));
    }

    let grant = state.pipeline.permissions.grants().set(
        &body.user_id,
        &experiment_id,
        body.permissions.iter().map(|p| p.as_str()),
    );
    tracing::info!(
        admin = %identity.subject_id(),
        subject_id = %grant.subject_id,
        resource_id = %grant.resource_id,
        permissions = ?grant.permissions,
        "Resource grant updated"
    );

    Ok(Json(SetPermissionsResponse {
        message: "Permissions updated successfully".to_owned(),
        grant,
    }))
}

/// Grants currently set on an experiment.
#[utoipa::path(
    get,
    path = "/admin/experiments/{experiment_id}/permissions",
    tag = "admin",
    security(("bearer" = [])),
    params(("experiment_id" = String, Path, description = "Experiment id")),
    responses(
        (status = 200, body = [ResourceGrant]),
        (status = 403, body = crate::problem::Problem)
    )
)]
pub async fn list_experiment_permissions(
    State(state): State<GatewayState>,
    Extension(identity): Extension<Identity>,
    Path(experiment_id): Path<String>,
) -> Result<Json<Vec<ResourceGrant>>, GatewayError> {
    require_admin(&state, &identity)?;
    Ok(Json(
        state
            .pipeline
            .permissions
            .grants()
            .list_for_resource(&experiment_id),
    ))
}
