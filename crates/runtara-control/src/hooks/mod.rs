// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lifecycle hooks.
//!
//! Hooks hang off role nodes and fire at trigger points of a transition:
//!
//! ```text
//! before_<EVENT>  ->  leave_<FROM>  ->  do()  ->  commit  ->  enter_<TO>  ->  after_<EVENT>
//! ```
//!
//! Call-hooks run through a [`CallHandler`] and may be awaited at a later
//! trigger than the one that started them. Task-hooks are short-lived tasks
//! started through the task coordinator and always awaited in place.

mod call;
mod engine;
pub mod mock;
mod trigger;

pub use call::{CallError, CallHandler, CallRequest, PendingCall};
pub use engine::{HookEngine, HookHost, WeightFilter};
pub use mock::MockCallHandler;
pub use trigger::{HookTraits, Trigger};

use crate::workflow::BoundTask;

/// A hook as seen at one trigger.
#[derive(Debug, Clone)]
pub struct Hook {
    /// Path of the role the hook belongs to.
    pub role_path: String,
    /// Name of that role.
    pub role_name: String,
    /// Trigger, await point, timeout and criticality.
    pub traits: HookTraits,
    /// What runs.
    pub kind: HookKind,
}

/// What a hook runs.
#[derive(Debug, Clone)]
pub enum HookKind {
    /// An inline call.
    Call {
        /// Function.
        func: String,
        /// Runtime variable receiving the output.
        return_var: Option<String>,
    },
    /// A task-hook.
    Task {
        /// Bound task, if the role was deployed.
        task: Option<BoundTask>,
        /// Whether the task-role owning the hook task is ACTIVE.
        active: bool,
    },
}
