// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Messages between environments and the task coordinator.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::{EnvironmentId, TaskId};
use crate::offers::TaskDescriptor;
use crate::workflow::{Status, TaskState};

/// Task-level command carried by [`EnvironmentMessage::TransitionTasks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskCommand {
    /// STANDBY to CONFIGURED.
    Configure,
    /// CONFIGURED to RUNNING.
    Start,
    /// RUNNING to CONFIGURED.
    Stop,
    /// CONFIGURED to STANDBY.
    Reset,
    /// ERROR to STANDBY.
    Recover,
    /// Any state to ERROR.
    GoError,
    /// STANDBY or CONFIGURED to DONE.
    Exit,
}

impl TaskCommand {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Configure => "CONFIGURE",
            Self::Start => "START",
            Self::Stop => "STOP",
            Self::Reset => "RESET",
            Self::Recover => "RECOVER",
            Self::GoError => "GO_ERROR",
            Self::Exit => "EXIT",
        }
    }
}

impl std::fmt::Display for TaskCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requests from an environment to the task coordinator.
#[derive(Debug, Clone)]
pub enum EnvironmentMessage {
    /// Find offers for and launch these descriptors.
    AcquireTasks {
        /// Requesting environment.
        env_id: EnvironmentId,
        /// Descriptors of the unbound task-roles.
        descriptors: Vec<TaskDescriptor>,
    },
    /// Push configuration to tasks and move them to CONFIGURED.
    ConfigureTasks {
        /// Requesting environment.
        env_id: EnvironmentId,
        /// Target tasks.
        tasks: Vec<TaskId>,
        /// Configuration arguments.
        args: BTreeMap<String, String>,
    },
    /// Drive tasks through one task-level transition.
    TransitionTasks {
        /// Requesting environment.
        env_id: EnvironmentId,
        /// Target tasks.
        tasks: Vec<TaskId>,
        /// Expected source state.
        src: TaskState,
        /// Command.
        event: TaskCommand,
        /// Expected destination state.
        dst: TaskState,
        /// Command arguments, e.g. `runNumber`.
        args: BTreeMap<String, String>,
    },
    /// Detach tasks from the environment.
    ReleaseTasks {
        /// Requesting environment.
        env_id: EnvironmentId,
        /// Target tasks.
        tasks: Vec<TaskId>,
    },
    /// Kill tasks and drop the environment's pending descriptors. No reply.
    KillTasks {
        /// Requesting environment.
        env_id: EnvironmentId,
        /// Target tasks.
        tasks: Vec<TaskId>,
    },
    /// Run task-hooks to completion.
    TriggerHooks {
        /// Requesting environment.
        env_id: EnvironmentId,
        /// Hook tasks.
        tasks: Vec<TaskId>,
    },
}

impl EnvironmentMessage {
    /// Environment the message belongs to.
    pub fn env_id(&self) -> EnvironmentId {
        match self {
            Self::AcquireTasks { env_id, .. }
            | Self::ConfigureTasks { env_id, .. }
            | Self::TransitionTasks { env_id, .. }
            | Self::ReleaseTasks { env_id, .. }
            | Self::KillTasks { env_id, .. }
            | Self::TriggerHooks { env_id, .. } => *env_id,
        }
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AcquireTasks { .. } => "acquire_tasks",
            Self::ConfigureTasks { .. } => "configure_tasks",
            Self::TransitionTasks { .. } => "transition_tasks",
            Self::ReleaseTasks { .. } => "release_tasks",
            Self::KillTasks { .. } => "kill_tasks",
            Self::TriggerHooks { .. } => "trigger_hooks",
        }
    }
}

/// Replies and notifications from the task coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    /// Tasks reached new states. A configure or transition request gets
    /// exactly one of these, covering every task it named.
    TasksStateChanged {
        /// Owning environment.
        env_id: EnvironmentId,
        /// State of each task. Tasks the coordinator does not hold for the
        /// environment are UNKNOWN.
        states: BTreeMap<TaskId, TaskState>,
        /// Failures, keyed by task.
        errors: BTreeMap<TaskId, String>,
    },
    /// Result of a release request.
    TasksReleased {
        /// Owning environment.
        env_id: EnvironmentId,
        /// Tasks that were asked to be released.
        task_ids: Vec<TaskId>,
        /// Tasks that could not be released.
        errors: BTreeMap<TaskId, String>,
    },
    /// Acquisition progress for one task-role.
    TaskStatusChanged {
        /// Owning environment.
        env_id: EnvironmentId,
        /// Task-role.
        role_path: String,
        /// Launched task, if any.
        task_id: Option<TaskId>,
        /// Host of the launched task.
        hostname: Option<String>,
        /// New status.
        status: Status,
    },
    /// A task exited.
    TaskTerminated {
        /// Owning environment.
        env_id: EnvironmentId,
        /// Task.
        task_id: TaskId,
        /// Process exit code.
        exit_code: i32,
        /// Whether the task exited on its own rather than being killed.
        voluntary: bool,
        /// Captured stdout.
        stdout: String,
        /// Captured stderr.
        stderr: String,
    },
}

impl TaskEvent {
    /// `tasks` all reached `state` without errors.
    pub fn state_changed(
        env_id: EnvironmentId,
        tasks: impl IntoIterator<Item = TaskId>,
        state: TaskState,
    ) -> Self {
        Self::TasksStateChanged {
            env_id,
            states: tasks.into_iter().map(|id| (id, state)).collect(),
            errors: BTreeMap::new(),
        }
    }

    /// Environment the event belongs to.
    pub fn env_id(&self) -> EnvironmentId {
        match self {
            Self::TasksStateChanged { env_id, .. }
            | Self::TasksReleased { env_id, .. }
            | Self::TaskStatusChanged { env_id, .. }
            | Self::TaskTerminated { env_id, .. } => *env_id,
        }
    }
}
