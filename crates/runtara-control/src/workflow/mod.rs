// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Role trees: the deployable structure of an environment.
//!
//! A workflow is a tree of [`Role`]s. Aggregators group children, task-roles
//! are backed by one launched task and call-roles run an inline call at a
//! lifecycle trigger. Status and state of inner nodes are folded from their
//! children.

mod class;
mod loader;
mod role;
mod status;

use std::collections::BTreeMap;

pub use class::{Addressing, ControlMode, InboundChannel, Limits, OutboundChannel, TaskClass};
pub use loader::{JsonWorkflowLoader, StaticWorkflowLoader, WorkflowError, WorkflowLoader};
pub use role::{
    BoundTask, CallRole, PATH_SEPARATOR, Role, RoleError, RoleKind, TaskInfo, TaskRole,
};
pub use status::{Status, TaskState, aggregate_state, aggregate_status};

/// Separator between a role path and a variable name in targeted request vars.
pub const ROLE_VAR_SEPARATOR: char = ':';

/// Split request variables into root-level vars and role-targeted vars.
///
/// A key of the form `<role path>:<name>` is applied to the role at that
/// path; every other key is returned as an environment variable.
pub fn apply_role_vars(
    root: &mut Role,
    vars: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>, RoleError> {
    let mut env_vars = BTreeMap::new();
    for (key, value) in vars {
        match key.rsplit_once(ROLE_VAR_SEPARATOR) {
            Some((path, name)) if !path.is_empty() && !name.is_empty() => {
                let role = root
                    .find_mut(path)
                    .ok_or_else(|| RoleError::NotFound(path.to_string()))?;
                role.vars.insert(name.to_string(), value.clone());
            }
            _ => {
                env_vars.insert(key.clone(), value.clone());
            }
        }
    }
    Ok(env_vars)
}
