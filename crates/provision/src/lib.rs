//! Rollout Provision: the platform-side stages of a rollout.
//!
//! Each operation reads the immutable config snapshot and talks to the platform
//! through [`rollout_platform::PlatformApi`]. Fatal conditions come back as
//! [`rollout_core::RolloutError`]; tolerated ones are logged and skipped.

#![forbid(unsafe_code)]

pub mod application;
pub mod discovery;
pub mod roles;
pub mod tenants;
pub mod users;

pub use application::{
    assemble_application, create_application, descriptor_url, placement, plan_modules, remove_applications, Placement,
    PlannedModule,
};
pub use discovery::{discovery_entry, update_discovery};
pub use roles::{
    attach_capability_sets, bind_capability_sets, create_roles, detach_capability_sets, find_role_by_name, platform_role_name,
    remove_roles, select_capability_sets, CapabilitySelection, RoleBinding, RoleLookup,
};
pub use tenants::{configured_tenants, create_entitlements, create_tenants, remove_entitlements, remove_tenants};
pub use users::{create_users, remove_users, ProvisionedUser};
