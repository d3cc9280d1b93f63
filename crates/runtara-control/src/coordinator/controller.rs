// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Driving launched tasks.

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use super::message::TaskCommand;
use crate::ids::{EnvironmentId, TaskId};
use crate::workflow::TaskState;

/// Task controller errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ControllerError {
    /// The task is not reachable on its control port.
    #[error("task {0} unreachable")]
    Unreachable(TaskId),
    /// The task rejected or failed the command.
    #[error("task {task_id} failed {command}: {reason}")]
    CommandFailed {
        /// Task.
        task_id: TaskId,
        /// Command name.
        command: String,
        /// Reason given by the task.
        reason: String,
    },
    /// Other failure.
    #[error("{0}")]
    Other(String),
}

/// What the controller knows about a launched task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskHandle {
    /// Task.
    pub task_id: TaskId,
    /// Owning environment.
    pub env_id: EnvironmentId,
    /// Task-role path.
    pub role_path: String,
    /// Host.
    pub hostname: String,
    /// Control port assigned at launch.
    pub control_port: u64,
}

/// Exit of a task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskExit {
    /// Process exit code.
    pub exit_code: i32,
    /// Whether the task exited on its own.
    pub voluntary: bool,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

/// Something the controller observed on its own, outside any request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskNotice {
    /// The task exited.
    Exited {
        /// Task.
        task_id: TaskId,
        /// Exit details.
        exit: TaskExit,
    },
    /// The task changed state.
    StateChanged {
        /// Task.
        task_id: TaskId,
        /// New state.
        state: TaskState,
        /// Error reported with the change.
        error: Option<String>,
    },
}

/// Drives tasks through their own state machines.
#[async_trait]
pub trait TaskController: Send + Sync {
    /// Push configuration and move the task to CONFIGURED. Returns the state reached.
    async fn configure(
        &self,
        task: &TaskHandle,
        args: &BTreeMap<String, String>,
    ) -> Result<TaskState, ControllerError>;

    /// Run one task-level transition. Returns the state reached.
    async fn transition(
        &self,
        task: &TaskHandle,
        command: TaskCommand,
        args: &BTreeMap<String, String>,
    ) -> Result<TaskState, ControllerError>;

    /// Detach the task from its environment. The task stays alive.
    async fn release(&self, _task: &TaskHandle) -> Result<(), ControllerError> {
        Ok(())
    }

    /// Kill the task.
    async fn kill(&self, task: &TaskHandle) -> Result<(), ControllerError>;

    /// Run a task-hook to completion.
    async fn run_hook(&self, task: &TaskHandle) -> Result<TaskExit, ControllerError>;

    /// Stream of notices about tasks, taken once by the coordinator.
    fn take_notices(&self) -> Option<mpsc::UnboundedReceiver<TaskNotice>> {
        None
    }
}
