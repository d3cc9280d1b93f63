// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock task controller for testing.
//!
//! Tasks move to the state their command implies. Failures, hangs and
//! spontaneous exits can be scripted per task-role.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};

use super::controller::{ControllerError, TaskController, TaskExit, TaskHandle, TaskNotice};
use super::message::TaskCommand;
use crate::ids::TaskId;
use crate::workflow::TaskState;

/// State a command leads to when it succeeds.
pub fn command_outcome(command: TaskCommand) -> TaskState {
    match command {
        TaskCommand::Configure | TaskCommand::Stop => TaskState::Configured,
        TaskCommand::Start => TaskState::Running,
        TaskCommand::Reset | TaskCommand::Recover => TaskState::Standby,
        TaskCommand::GoError => TaskState::Error,
        TaskCommand::Exit => TaskState::Done,
    }
}

/// Mock task controller.
#[derive(Debug)]
pub struct MockTaskController {
    commands: Arc<Mutex<Vec<(String, TaskCommand)>>>,
    killed: Arc<Mutex<Vec<TaskId>>>,
    failing: HashSet<(String, TaskCommand)>,
    hanging: HashSet<String>,
    hook_exits: HashMap<String, TaskExit>,
    refused_releases: std::sync::Mutex<HashSet<String>>,
    /// Delay applied to every command.
    pub command_delay: Duration,
    notices_tx: mpsc::UnboundedSender<TaskNotice>,
    notices_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<TaskNotice>>>,
}

impl Default for MockTaskController {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTaskController {
    /// Create a controller where every command succeeds.
    pub fn new() -> Self {
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        Self {
            commands: Arc::new(Mutex::new(Vec::new())),
            killed: Arc::new(Mutex::new(Vec::new())),
            failing: HashSet::new(),
            hanging: HashSet::new(),
            hook_exits: HashMap::new(),
            refused_releases: std::sync::Mutex::new(HashSet::new()),
            command_delay: Duration::ZERO,
            notices_tx,
            notices_rx: std::sync::Mutex::new(Some(notices_rx)),
        }
    }

    /// Fail `command` for the task of `role_path`.
    pub fn failing_on(mut self, role_path: impl Into<String>, command: TaskCommand) -> Self {
        self.failing.insert((role_path.into(), command));
        self
    }

    /// Never answer commands for the task of `role_path`.
    pub fn hanging_on(mut self, role_path: impl Into<String>) -> Self {
        self.hanging.insert(role_path.into());
        self
    }

    /// Exit the task-hook of `role_path` with `exit`.
    pub fn with_hook_exit(mut self, role_path: impl Into<String>, exit: TaskExit) -> Self {
        self.hook_exits.insert(role_path.into(), exit);
        self
    }

    /// Refuse the next release of the task of `role_path`.
    pub fn refusing_release_on(self, role_path: impl Into<String>) -> Self {
        self.refused_releases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(role_path.into());
        self
    }

    /// Delay every command.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.command_delay = delay;
        self
    }

    /// Report that a task died on its own.
    pub fn crash(&self, task_id: &TaskId, exit_code: i32) {
        let _ = self.notices_tx.send(TaskNotice::Exited {
            task_id: task_id.clone(),
            exit: TaskExit {
                exit_code,
                voluntary: false,
                stdout: String::new(),
                stderr: format!("killed with exit code {exit_code}"),
            },
        });
    }

    /// Report that a task changed state on its own.
    pub fn report_state(&self, task_id: &TaskId, state: TaskState, error: Option<String>) {
        let _ = self.notices_tx.send(TaskNotice::StateChanged {
            task_id: task_id.clone(),
            state,
            error,
        });
    }

    /// Commands received as `(role path, command)`, in order.
    pub async fn commands(&self) -> Vec<(String, TaskCommand)> {
        self.commands.lock().await.clone()
    }

    /// Killed tasks, in order.
    pub async fn killed(&self) -> Vec<TaskId> {
        self.killed.lock().await.clone()
    }

    async fn run(&self, task: &TaskHandle, command: TaskCommand) -> Result<TaskState, ControllerError> {
        self.commands
            .lock()
            .await
            .push((task.role_path.clone(), command));
        if self.hanging.contains(&task.role_path) {
            std::future::pending::<()>().await;
        }
        if !self.command_delay.is_zero() {
            tokio::time::sleep(self.command_delay).await;
        }
        if self.failing.contains(&(task.role_path.clone(), command)) {
            return Err(ControllerError::CommandFailed {
                task_id: task.task_id.clone(),
                command: command.to_string(),
                reason: "scripted failure".into(),
            });
        }
        Ok(command_outcome(command))
    }
}

#[async_trait]
impl TaskController for MockTaskController {
    async fn configure(
        &self,
        task: &TaskHandle,
        _args: &BTreeMap<String, String>,
    ) -> Result<TaskState, ControllerError> {
        self.run(task, TaskCommand::Configure).await
    }

    async fn transition(
        &self,
        task: &TaskHandle,
        command: TaskCommand,
        _args: &BTreeMap<String, String>,
    ) -> Result<TaskState, ControllerError> {
        self.run(task, command).await
    }

    async fn release(&self, task: &TaskHandle) -> Result<(), ControllerError> {
        let refused = self
            .refused_releases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&task.role_path);
        if refused {
            return Err(ControllerError::CommandFailed {
                task_id: task.task_id.clone(),
                command: "release".into(),
                reason: "scripted failure".into(),
            });
        }
        Ok(())
    }

    async fn kill(&self, task: &TaskHandle) -> Result<(), ControllerError> {
        self.killed.lock().await.push(task.task_id.clone());
        Ok(())
    }

    async fn run_hook(&self, task: &TaskHandle) -> Result<TaskExit, ControllerError> {
        if self.hanging.contains(&task.role_path) {
            std::future::pending::<()>().await;
        }
        Ok(self
            .hook_exits
            .get(&task.role_path)
            .cloned()
            .unwrap_or(TaskExit {
                exit_code: 0,
                voluntary: true,
                stdout: String::new(),
                stderr: String::new(),
            }))
    }

    fn take_notices(&self) -> Option<mpsc::UnboundedReceiver<TaskNotice>> {
        self.notices_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}
