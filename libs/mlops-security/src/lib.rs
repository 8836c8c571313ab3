#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
pub mod identity;
pub mod permission;

pub use identity::{Identity, IdentityBuilder};
pub use permission::{ADMIN_PERMISSION, ParsePermissionError, Permission, RoleNames};
