// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request/reply round trips with the task coordinator.
//!
//! Every round trip subscribes to the mailbox before sending, so a reply
//! cannot slip past, and drops the subscription on every exit path.

use std::collections::{BTreeSet, HashMap};

use tokio::time::{Instant, timeout_at};
use tracing::{debug, warn};

use super::{Environment, is_cleanup_trigger};
use crate::coordinator::{EnvironmentMessage, TaskEvent};
use crate::error::{Error, Result};
use crate::hooks::{Hook, HookKind};
use crate::ids::TaskId;
use crate::workflow::{RoleKind, Status, TaskState};

impl Environment {
    /// Send `message` and wait until every task of `targets` has answered
    /// and reached `dst`. Fails early when a critical target goes to ERROR.
    /// A non-critical target in ERROR never reaches `dst`, so the wait ends
    /// in the timeout.
    pub(super) async fn await_tasks(
        &self,
        message: EnvironmentMessage,
        targets: Vec<TaskId>,
        dst: TaskState,
    ) -> Result<()> {
        if targets.is_empty() {
            return Ok(());
        }
        let targets: BTreeSet<TaskId> = targets.into_iter().collect();
        let timeout = self.ctx.config.deployment_timeout;
        let deadline = Instant::now() + timeout;
        let mut subscription = self.ctx.mailboxes.subscribe(self.id);
        self.send(message).await?;

        let mut answered = BTreeSet::new();
        loop {
            let event = match timeout_at(deadline, subscription.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) => return Err(Error::Coordination("task coordinator went away".into())),
                Err(_) => {
                    return Err(Error::Timeout(format!(
                        "timed out after {timeout:?} waiting for {} tasks to reach {dst}",
                        targets.len()
                    )));
                }
            };
            self.apply_event(&event);

            match &event {
                TaskEvent::TasksStateChanged { states, errors, .. } => {
                    let lost = states.iter().find_map(|(id, state)| {
                        (*state == TaskState::Unknown && targets.contains(id))
                            .then(|| errors.get(id))
                            .flatten()
                    });
                    if let Some(error) = lost {
                        return Err(Error::Coordination(error.clone()));
                    }
                    answered.extend(states.keys().filter(|id| targets.contains(*id)).cloned());
                }
                TaskEvent::TaskTerminated { task_id, .. } if targets.contains(task_id) => {
                    answered.insert(task_id.clone());
                }
                _ => {}
            }

            let tasks: Vec<_> = self
                .tasks()
                .into_iter()
                .filter(|t| targets.contains(&t.task_id))
                .collect();
            let failed: Vec<_> = tasks
                .iter()
                .filter(|t| t.critical && t.state == TaskState::Error)
                .collect();
            match failed.as_slice() {
                [] => {}
                [task] => {
                    return Err(Error::Coordination(format!(
                        "critical task '{}' on host '{}' transitioned to ERROR",
                        task.role_path, task.hostname
                    )));
                }
                many => {
                    return Err(Error::Coordination(format!(
                        "{} critical tasks transitioned to ERROR, could not determine the first one to fail",
                        many.len()
                    )));
                }
            }

            if answered.len() == targets.len() && tasks.iter().all(|t| t.state == dst) {
                debug!(env_id = %self.id, count = targets.len(), state = %dst, "tasks reached state");
                return Ok(());
            }
        }
    }

    /// Ask the coordinator for the unbound task-roles and wait until the
    /// workflow is ACTIVE. On failure every acquired task is killed.
    pub(super) async fn acquire_tasks(&self) -> Result<()> {
        let descriptors = {
            let mut workflow = self.write_workflow();
            workflow.set_call_status(Status::Active);
            workflow.descriptors(self.id)
        };
        if descriptors.is_empty() {
            return Ok(());
        }

        let timeout = self.ctx.config.deployment_timeout;
        let deadline = Instant::now() + timeout;
        let mut subscription = self.ctx.mailboxes.subscribe(self.id);
        let result = match self
            .send(EnvironmentMessage::AcquireTasks {
                env_id: self.id,
                descriptors,
            })
            .await
        {
            Ok(()) => loop {
                let status = self.read_workflow().status();
                match status {
                    Status::Active => break Ok(()),
                    Status::Undeployable => {
                        let undeployable = self.task_roles_with(Status::Undeployable);
                        break Err(Error::Coordination(format!(
                            "workflow deployment failed (one or more roles undeployable), aborting and cleaning up [undeployable roles: {}]",
                            undeployable.join(", ")
                        )));
                    }
                    _ => {}
                }
                match timeout_at(deadline, subscription.recv()).await {
                    Ok(Some(event)) => {
                        self.apply_event(&event);
                    }
                    Ok(None) => break Err(Error::Coordination("task coordinator went away".into())),
                    Err(_) => {
                        let undeployable = self.task_roles_with(Status::Undeployable);
                        let inactive = self.task_roles_with(Status::Inactive);
                        break Err(Error::Timeout(format!(
                            "workflow deployment timed out ({timeout:?}), aborting and cleaning up [{} undeployable roles: {}; {} inactive roles: {}]",
                            undeployable.len(),
                            undeployable.join(", "),
                            inactive.len(),
                            inactive.join(", ")
                        )));
                    }
                }
            },
            Err(e) => Err(e),
        };
        drop(subscription);

        if result.is_err() {
            self.abandon_tasks().await;
        }
        result
    }

    /// Kill every bound task, drop pending descriptors and unbind the roles.
    async fn abandon_tasks(&self) {
        let tasks = self.task_ids();
        let message = EnvironmentMessage::KillTasks {
            env_id: self.id,
            tasks: tasks.clone(),
        };
        if let Err(e) = self.send(message).await {
            warn!(env_id = %self.id, error = %e, "failed to kill acquired tasks");
        }
        let mut workflow = self.write_workflow();
        for task_id in &tasks {
            workflow.unbind_task(task_id);
        }
    }

    /// Sorted paths of the task-roles with `status`.
    fn task_roles_with(&self, status: Status) -> Vec<String> {
        let workflow = self.read_workflow();
        let mut paths: Vec<String> = workflow
            .walk()
            .into_iter()
            .filter(|r| matches!(r.kind, RoleKind::Task(_)) && r.status() == status)
            .map(|r| r.path().to_string())
            .collect();
        paths.sort();
        paths
    }

    /// Release `tasks` and wait for the answer. Released ids are appended to
    /// `released` even when some tasks fail.
    pub(super) async fn release_tasks(
        &self,
        tasks: Vec<TaskId>,
        released: &mut Vec<TaskId>,
    ) -> Result<()> {
        if tasks.is_empty() {
            return Ok(());
        }
        let timeout = self.ctx.config.deployment_timeout;
        let deadline = Instant::now() + timeout;
        let mut subscription = self.ctx.mailboxes.subscribe(self.id);
        self.send(EnvironmentMessage::ReleaseTasks {
            env_id: self.id,
            tasks: tasks.clone(),
        })
        .await?;

        loop {
            let event = match timeout_at(deadline, subscription.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) => return Err(Error::Coordination("task coordinator went away".into())),
                Err(_) => {
                    return Err(Error::Timeout(format!(
                        "timed out after {timeout:?} waiting for {} tasks to be released",
                        tasks.len()
                    )));
                }
            };
            self.apply_event(&event);
            let TaskEvent::TasksReleased {
                task_ids, errors, ..
            } = event
            else {
                continue;
            };
            released.extend(task_ids.into_iter().filter(|id| !errors.contains_key(id)));
            if errors.is_empty() {
                return Ok(());
            }
            for (task_id, reason) in &errors {
                warn!(env_id = %self.id, task_id = %task_id, reason = %reason, "task not released");
            }
            return Err(Error::Coordination(format!(
                "{} tasks could not be released",
                errors.len()
            )));
        }
    }

    /// Run task-hooks and wait for each to terminate within its own timeout.
    /// At the cleanup triggers, hooks whose task-role is not ACTIVE are
    /// skipped.
    pub(super) async fn await_task_hooks(
        &self,
        trigger: &str,
        hooks: &[Hook],
    ) -> Vec<std::result::Result<(), String>> {
        let destroy = is_cleanup_trigger(trigger);
        let mut results: Vec<Option<std::result::Result<(), String>>> = vec![None; hooks.len()];
        let mut waiting: HashMap<TaskId, (usize, Instant, std::time::Duration)> = HashMap::new();
        let now = Instant::now();

        for (index, hook) in hooks.iter().enumerate() {
            match &hook.kind {
                HookKind::Task {
                    task: Some(bound),
                    active,
                } if *active || !destroy => {
                    let timeout = hook.traits.timeout_or(self.ctx.config.hook_timeout);
                    waiting.insert(bound.task_id.clone(), (index, now + timeout, timeout));
                }
                HookKind::Task { .. } if destroy => results[index] = Some(Ok(())),
                HookKind::Task { .. } => {
                    results[index] = Some(Err(format!("hook task {} is not deployed", hook.role_name)));
                }
                HookKind::Call { .. } => results[index] = Some(Ok(())),
            }
        }

        if !waiting.is_empty() {
            let mut subscription = self.ctx.mailboxes.subscribe(self.id);
            let message = EnvironmentMessage::TriggerHooks {
                env_id: self.id,
                tasks: waiting.keys().cloned().collect(),
            };
            if let Err(e) = self.send(message).await {
                for (index, _, _) in waiting.drain().map(|(_, w)| w) {
                    results[index] = Some(Err(e.to_string()));
                }
            }

            while let Some(next) = waiting.values().map(|(_, deadline, _)| *deadline).min() {
                match timeout_at(next, subscription.recv()).await {
                    Ok(Some(event)) => {
                        self.apply_event(&event);
                        let TaskEvent::TaskTerminated {
                            task_id,
                            exit_code,
                            voluntary,
                            stderr,
                            ..
                        } = event
                        else {
                            continue;
                        };
                        let Some((index, _, _)) = waiting.remove(&task_id) else {
                            continue;
                        };
                        results[index] = Some(if exit_code == 0 && voluntary {
                            Ok(())
                        } else if voluntary {
                            Err(format!(
                                "hook task {} exited with code {exit_code}: {stderr}",
                                hooks[index].role_name
                            ))
                        } else {
                            Err(format!(
                                "hook task {} was terminated with code {exit_code}: {stderr}",
                                hooks[index].role_name
                            ))
                        });
                    }
                    Ok(None) => {
                        for (index, _, _) in waiting.drain().map(|(_, w)| w) {
                            results[index] = Some(Err("task coordinator went away".into()));
                        }
                    }
                    Err(_) => {
                        let now = Instant::now();
                        let expired: Vec<TaskId> = waiting
                            .iter()
                            .filter(|(_, (_, deadline, _))| *deadline <= now)
                            .map(|(id, _)| id.clone())
                            .collect();
                        for task_id in expired {
                            if let Some((index, _, timeout)) = waiting.remove(&task_id) {
                                results[index] = Some(Err(format!(
                                    "hook task {} timed out after {timeout:?}",
                                    hooks[index].role_name
                                )));
                            }
                        }
                    }
                }
            }
        }

        results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| Err("hook task produced no result".into())))
            .collect()
    }
}
