use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Grant entry that allows every action on a resource.
pub const ADMIN_PERMISSION: &str = "admin";

/// Action requested on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
    Admin,
}

impl Permission {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Admin => ADMIN_PERMISSION,
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown permission: {0}")]
pub struct ParsePermissionError(String);

impl FromStr for Permission {
    type Err = ParsePermissionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(Self::Read),
            "write" => Ok(Self::Write),
            ADMIN_PERMISSION => Ok(Self::Admin),
            other => Err(ParsePermissionError(other.to_owned())),
        }
    }
}

/// Role claim values that map to the three global roles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RoleNames {
    pub admin: String,
    pub write: String,
    pub read: String,
}

impl Default for RoleNames {
    fn default() -> Self {
        Self {
            admin: "mlflow:admin".to_owned(),
            write: "mlflow:write".to_owned(),
            read: "mlflow:read".to_owned(),
        }
    }
}
