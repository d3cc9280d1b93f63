// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The task coordinator worker.
//!
//! Consumes [`EnvironmentMessage`]s and resource offer batches. Pending
//! descriptors are matched against every offer batch; matched offers are
//! accepted and the rest declined after the roster lock is released. Task
//! commands are fanned out to the [`TaskController`] and answered with
//! [`TaskEvent`]s on the reply channel.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::join_all;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, error, info, warn};

use super::controller::{TaskController, TaskHandle, TaskNotice};
use super::message::{EnvironmentMessage, TaskCommand, TaskEvent};
use crate::ids::{EnvironmentId, TaskId};
use crate::offers::{Launch, Offer, OfferMatcher, ResourceManager, TaskDescriptor};
use crate::workflow::{Status, TaskState};

/// A launched task known to the coordinator.
#[derive(Debug, Clone)]
struct TaskRecord {
    handle: TaskHandle,
    /// `None` once released.
    owner: Option<EnvironmentId>,
    state: TaskState,
}

#[derive(Debug, Default)]
struct Roster {
    pending: Vec<TaskDescriptor>,
    tasks: HashMap<TaskId, TaskRecord>,
}

/// Shared handling context, cloned into each spawned request.
#[derive(Clone)]
struct Context {
    controller: Arc<dyn TaskController>,
    resources: Arc<dyn ResourceManager>,
    events: mpsc::UnboundedSender<TaskEvent>,
    roster: Arc<Mutex<Roster>>,
}

/// Background worker that owns the launched tasks.
pub struct TaskManager {
    messages: mpsc::Receiver<EnvironmentMessage>,
    offers: mpsc::Receiver<Vec<Offer>>,
    notices: Option<mpsc::UnboundedReceiver<TaskNotice>>,
    matcher: OfferMatcher,
    ctx: Context,
    shutdown: Arc<Notify>,
}

impl TaskManager {
    /// Create a coordinator. Replies are sent on `events`.
    pub fn new(
        messages: mpsc::Receiver<EnvironmentMessage>,
        offers: mpsc::Receiver<Vec<Offer>>,
        events: mpsc::UnboundedSender<TaskEvent>,
        controller: Arc<dyn TaskController>,
        resources: Arc<dyn ResourceManager>,
        matcher: OfferMatcher,
    ) -> Self {
        let notices = controller.take_notices();
        Self {
            messages,
            offers,
            notices,
            matcher,
            ctx: Context {
                controller,
                resources,
                events,
                roster: Arc::new(Mutex::new(Roster::default())),
            },
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the coordinator loop until shutdown.
    pub async fn run(mut self) {
        info!("Task manager started");

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Task manager received shutdown signal");
                    break;
                }

                Some(message) = self.messages.recv() => {
                    debug!(env_id = %message.env_id(), kind = message.kind(), "coordinator message");
                    let ctx = self.ctx.clone();
                    tokio::spawn(async move { ctx.handle(message).await });
                }

                Some(batch) = self.offers.recv() => {
                    self.handle_offers(batch).await;
                }

                Some(notice) = next_notice(&mut self.notices) => {
                    self.ctx.handle_notice(notice);
                }
            }
        }

        info!("Task manager stopped");
    }

    /// Match pending descriptors against one offer batch.
    async fn handle_offers(&self, batch: Vec<Offer>) {
        let nothing_pending = self.ctx.lock().pending.is_empty();
        if nothing_pending {
            let ids: Vec<String> = batch.into_iter().map(|o| o.id).collect();
            self.decline(&ids).await;
            return;
        }

        let (outcome, originals) = {
            let mut roster = self.ctx.lock();
            let originals: HashMap<(EnvironmentId, String), TaskDescriptor> = roster
                .pending
                .iter()
                .map(|d| ((d.env_id, d.role_path.clone()), d.clone()))
                .collect();
            let outcome = self.matcher.match_offers(&mut roster.pending, &batch);
            (outcome, originals)
        };

        for descriptor in &outcome.undeployable {
            self.ctx.emit(TaskEvent::TaskStatusChanged {
                env_id: descriptor.env_id,
                role_path: descriptor.role_path.clone(),
                task_id: None,
                hostname: None,
                status: Status::Undeployable,
            });
        }

        for (offer_id, launches) in &outcome.accepted {
            match self.ctx.resources.accept(offer_id, launches).await {
                Ok(()) => {
                    for launch in launches {
                        self.ctx.register(launch);
                    }
                }
                Err(e) => {
                    warn!(offer = %offer_id, error = %e, "accept failed, descriptors stay pending");
                    let mut roster = self.ctx.lock();
                    for launch in launches {
                        if let Some(d) = originals.get(&(launch.env_id, launch.role_path.clone())) {
                            roster.pending.push(d.clone());
                        }
                    }
                }
            }
        }

        if !outcome.declined.is_empty() {
            self.decline(&outcome.declined).await;
        }
    }

    async fn decline(&self, offer_ids: &[String]) {
        if offer_ids.is_empty() {
            return;
        }
        if let Err(e) = self.ctx.resources.decline(offer_ids).await {
            warn!(count = offer_ids.len(), error = %e, "failed to decline offers");
        }
    }
}

async fn next_notice(rx: &mut Option<mpsc::UnboundedReceiver<TaskNotice>>) -> Option<TaskNotice> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl Context {
    fn lock(&self) -> MutexGuard<'_, Roster> {
        self.roster.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: TaskEvent) {
        if self.events.send(event).is_err() {
            error!("task event channel closed");
        }
    }

    fn register(&self, launch: &Launch) {
        let handle = TaskHandle {
            task_id: launch.task_id.clone(),
            env_id: launch.env_id,
            role_path: launch.role_path.clone(),
            hostname: launch.hostname.clone(),
            control_port: launch.control_port,
        };
        info!(
            env_id = %launch.env_id,
            task_id = %launch.task_id,
            role = %launch.role_path,
            host = %launch.hostname,
            "task launched"
        );
        self.lock().tasks.insert(
            launch.task_id.clone(),
            TaskRecord {
                handle,
                owner: Some(launch.env_id),
                state: TaskState::Standby,
            },
        );
        self.emit(TaskEvent::TaskStatusChanged {
            env_id: launch.env_id,
            role_path: launch.role_path.clone(),
            task_id: Some(launch.task_id.clone()),
            hostname: Some(launch.hostname.clone()),
            status: Status::Active,
        });
    }

    async fn handle(&self, message: EnvironmentMessage) {
        match message {
            EnvironmentMessage::AcquireTasks { env_id, descriptors } => {
                let mut roster = self.lock();
                roster
                    .pending
                    .retain(|p| !descriptors.iter().any(|d| d.env_id == p.env_id && d.role_path == p.role_path));
                debug!(env_id = %env_id, count = descriptors.len(), "descriptors pending");
                roster.pending.extend(descriptors);
            }
            EnvironmentMessage::ConfigureTasks { env_id, tasks, args } => {
                self.command(env_id, tasks, TaskCommand::Configure, args).await;
            }
            EnvironmentMessage::TransitionTasks {
                env_id,
                tasks,
                src,
                event,
                dst,
                args,
            } => {
                debug!(env_id = %env_id, %src, %event, %dst, count = tasks.len(), "transitioning tasks");
                self.command(env_id, tasks, event, args).await;
            }
            EnvironmentMessage::ReleaseTasks { env_id, tasks } => self.release(env_id, tasks).await,
            EnvironmentMessage::KillTasks { env_id, tasks } => self.kill(env_id, tasks).await,
            EnvironmentMessage::TriggerHooks { env_id, tasks } => self.run_hooks(env_id, tasks).await,
        }
    }

    /// Owned handles for `tasks`, with an error for every task the environment does not own.
    fn owned(
        &self,
        env_id: EnvironmentId,
        tasks: &[TaskId],
    ) -> (Vec<TaskHandle>, BTreeMap<TaskId, String>) {
        let roster = self.lock();
        let mut handles = Vec::with_capacity(tasks.len());
        let mut missing = BTreeMap::new();
        for id in tasks {
            match roster.tasks.get(id) {
                Some(record) if record.owner == Some(env_id) => handles.push(record.handle.clone()),
                _ => {
                    missing.insert(id.clone(), format!("task {id} not found in environment {env_id}"));
                }
            }
        }
        (handles, missing)
    }

    async fn command(
        &self,
        env_id: EnvironmentId,
        tasks: Vec<TaskId>,
        command: TaskCommand,
        args: BTreeMap<String, String>,
    ) {
        let (handles, missing) = self.owned(env_id, &tasks);
        let results = join_all(handles.iter().map(|handle| async {
            let result = match command {
                TaskCommand::Configure => self.controller.configure(handle, &args).await,
                other => self.controller.transition(handle, other, &args).await,
            };
            (handle.task_id.clone(), result)
        }))
        .await;

        let mut states = BTreeMap::new();
        let mut errors = BTreeMap::new();
        {
            let mut roster = self.lock();
            for (task_id, result) in results {
                let state = match result {
                    Ok(state) => state,
                    Err(e) => {
                        warn!(env_id = %env_id, task_id = %task_id, command = %command, error = %e, "task command failed");
                        errors.insert(task_id.clone(), e.to_string());
                        TaskState::Error
                    }
                };
                if let Some(record) = roster.tasks.get_mut(&task_id) {
                    record.state = state;
                }
                states.insert(task_id, state);
            }
        }
        for (task_id, reason) in missing {
            states.insert(task_id.clone(), TaskState::Unknown);
            errors.insert(task_id, reason);
        }

        self.emit(TaskEvent::TasksStateChanged {
            env_id,
            states,
            errors,
        });
    }

    async fn release(&self, env_id: EnvironmentId, tasks: Vec<TaskId>) {
        let (handles, mut errors) = self.owned(env_id, &tasks);
        let results = join_all(handles.iter().map(|handle| async {
            (handle.task_id.clone(), self.controller.release(handle).await)
        }))
        .await;
        {
            let mut roster = self.lock();
            for (task_id, result) in results {
                match result {
                    Ok(()) => {
                        if let Some(record) = roster.tasks.get_mut(&task_id) {
                            record.owner = None;
                        }
                    }
                    Err(e) => {
                        errors.insert(task_id, e.to_string());
                    }
                }
            }
        }
        debug!(env_id = %env_id, released = tasks.len() - errors.len(), failed = errors.len(), "tasks released");
        self.emit(TaskEvent::TasksReleased {
            env_id,
            task_ids: tasks,
            errors,
        });
    }

    async fn kill(&self, env_id: EnvironmentId, tasks: Vec<TaskId>) {
        let records: Vec<TaskRecord> = {
            let mut roster = self.lock();
            roster.pending.retain(|d| d.env_id != env_id);
            tasks.iter().filter_map(|id| roster.tasks.remove(id)).collect()
        };
        for record in records {
            if let Err(e) = self.controller.kill(&record.handle).await {
                warn!(env_id = %env_id, task_id = %record.handle.task_id, error = %e, "failed to kill task");
            }
        }
    }

    async fn run_hooks(&self, env_id: EnvironmentId, tasks: Vec<TaskId>) {
        let (handles, missing) = self.owned(env_id, &tasks);
        for (task_id, reason) in missing {
            self.emit(TaskEvent::TaskTerminated {
                env_id,
                task_id,
                exit_code: -1,
                voluntary: false,
                stdout: String::new(),
                stderr: reason,
            });
        }

        join_all(handles.iter().map(|handle| async {
            let exit = self.controller.run_hook(handle).await;
            let (exit_code, voluntary, stdout, stderr) = match exit {
                Ok(exit) => (exit.exit_code, exit.voluntary, exit.stdout, exit.stderr),
                Err(e) => (-1, false, String::new(), e.to_string()),
            };
            if let Some(record) = self.lock().tasks.get_mut(&handle.task_id) {
                record.state = if exit_code == 0 && voluntary {
                    TaskState::Done
                } else {
                    TaskState::Error
                };
            }
            self.emit(TaskEvent::TaskTerminated {
                env_id,
                task_id: handle.task_id.clone(),
                exit_code,
                voluntary,
                stdout,
                stderr,
            });
        }))
        .await;
    }

    fn handle_notice(&self, notice: TaskNotice) {
        match notice {
            TaskNotice::Exited { task_id, exit } => {
                let owner = {
                    let mut roster = self.lock();
                    roster.tasks.get_mut(&task_id).and_then(|record| {
                        record.state = if exit.exit_code == 0 && exit.voluntary {
                            TaskState::Done
                        } else {
                            TaskState::Error
                        };
                        record.owner
                    })
                };
                let Some(env_id) = owner else {
                    debug!(task_id = %task_id, "exit of unowned task");
                    return;
                };
                self.emit(TaskEvent::TaskTerminated {
                    env_id,
                    task_id,
                    exit_code: exit.exit_code,
                    voluntary: exit.voluntary,
                    stdout: exit.stdout,
                    stderr: exit.stderr,
                });
            }
            TaskNotice::StateChanged {
                task_id,
                state,
                error,
            } => {
                let owner = {
                    let mut roster = self.lock();
                    roster.tasks.get_mut(&task_id).and_then(|record| {
                        record.state = state;
                        record.owner
                    })
                };
                if let Some(env_id) = owner {
                    self.emit(TaskEvent::TasksStateChanged {
                        env_id,
                        states: BTreeMap::from([(task_id.clone(), state)]),
                        errors: error.map(|e| (task_id, e)).into_iter().collect(),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::MockTaskController;
    use crate::offers::{Constraints, MockResourceManager, Ranges};
    use crate::workflow::TaskClass;
    use std::time::Duration;

    struct Harness {
        messages: mpsc::Sender<EnvironmentMessage>,
        offers: mpsc::Sender<Vec<Offer>>,
        events: mpsc::UnboundedReceiver<TaskEvent>,
        resources: Arc<MockResourceManager>,
        controller: Arc<MockTaskController>,
        shutdown: Arc<Notify>,
    }

    fn start(controller: MockTaskController) -> Harness {
        let (msg_tx, msg_rx) = mpsc::channel(16);
        let (offer_tx, offer_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let resources = Arc::new(MockResourceManager::new());
        let controller = Arc::new(controller);
        let manager = TaskManager::new(
            msg_rx,
            offer_rx,
            event_tx,
            controller.clone(),
            resources.clone(),
            OfferMatcher::default(),
        );
        let shutdown = manager.shutdown_handle();
        tokio::spawn(manager.run());
        Harness {
            messages: msg_tx,
            offers: offer_tx,
            events: event_rx,
            resources,
            controller,
            shutdown,
        }
    }

    fn descriptor(env_id: EnvironmentId, path: &str) -> TaskDescriptor {
        TaskDescriptor {
            env_id,
            role_path: path.into(),
            class: TaskClass::new("c", "/bin/c").with_wants(1.0, 128.0),
            constraints: Constraints::default(),
            critical: true,
            detector: None,
        }
    }

    async fn next(h: &mut Harness) -> TaskEvent {
        tokio::time::timeout(Duration::from_secs(2), h.events.recv())
            .await
            .unwrap()
            .unwrap()
    }

    async fn acquire(h: &mut Harness, env_id: EnvironmentId) -> TaskId {
        h.messages
            .send(EnvironmentMessage::AcquireTasks {
                env_id,
                descriptors: vec![descriptor(env_id, "root.a")],
            })
            .await
            .unwrap();
        // let the request land before offering
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.offers
            .send(vec![Offer::new("o1", "flp001", 4.0, 4096.0, Ranges::span(30000, 30010))])
            .await
            .unwrap();
        match next(h).await {
            TaskEvent::TaskStatusChanged {
                task_id: Some(task_id),
                status: Status::Active,
                ..
            } => task_id,
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_acquire_configure_release() {
        let mut h = start(MockTaskController::new());
        let env_id = EnvironmentId::new();
        let task_id = acquire(&mut h, env_id).await;
        assert_eq!(h.resources.accepted().await.len(), 1);

        h.messages
            .send(EnvironmentMessage::ConfigureTasks {
                env_id,
                tasks: vec![task_id.clone()],
                args: BTreeMap::new(),
            })
            .await
            .unwrap();
        assert_eq!(
            next(&mut h).await,
            TaskEvent::state_changed(env_id, [task_id.clone()], TaskState::Configured)
        );

        h.messages
            .send(EnvironmentMessage::ReleaseTasks {
                env_id,
                tasks: vec![task_id.clone(), TaskId::from("ghost")],
            })
            .await
            .unwrap();
        match next(&mut h).await {
            TaskEvent::TasksReleased { errors, task_ids, .. } => {
                assert_eq!(task_ids.len(), 2);
                assert_eq!(errors.len(), 1);
                assert!(errors.contains_key(&TaskId::from("ghost")));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        h.messages
            .send(EnvironmentMessage::KillTasks {
                env_id,
                tasks: vec![task_id.clone()],
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.controller.killed().await, vec![task_id]);
        h.shutdown.notify_one();
    }

    #[tokio::test]
    async fn test_offers_declined_without_pending_work() {
        let h = start(MockTaskController::new());
        h.offers
            .send(vec![Offer::new("o1", "flp001", 4.0, 4096.0, Ranges::span(30000, 30010))])
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.resources.declined().await, vec!["o1".to_string()]);
        h.shutdown.notify_one();
    }

    #[tokio::test]
    async fn test_command_failure_reports_error_state() {
        let mut h = start(MockTaskController::new().failing_on("root.a", TaskCommand::Start));
        let env_id = EnvironmentId::new();
        let task_id = acquire(&mut h, env_id).await;

        h.messages
            .send(EnvironmentMessage::TransitionTasks {
                env_id,
                tasks: vec![task_id.clone()],
                src: TaskState::Configured,
                event: TaskCommand::Start,
                dst: TaskState::Running,
                args: BTreeMap::new(),
            })
            .await
            .unwrap();
        match next(&mut h).await {
            TaskEvent::TasksStateChanged { states, errors, .. } => {
                assert_eq!(states[&task_id], TaskState::Error);
                assert!(errors[&task_id].contains("scripted failure"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        h.shutdown.notify_one();
    }

    #[tokio::test]
    async fn test_configure_answers_once_per_request() {
        let mut h = start(MockTaskController::new().failing_on("root.a", TaskCommand::Configure));
        let env_id = EnvironmentId::new();
        let task_id = acquire(&mut h, env_id).await;
        let ghost = TaskId::from("ghost");

        h.messages
            .send(EnvironmentMessage::ConfigureTasks {
                env_id,
                tasks: vec![task_id.clone(), ghost.clone()],
                args: BTreeMap::new(),
            })
            .await
            .unwrap();
        match next(&mut h).await {
            TaskEvent::TasksStateChanged { states, errors, .. } => {
                assert_eq!(states.len(), 2);
                assert_eq!(states[&task_id], TaskState::Error);
                assert_eq!(states[&ghost], TaskState::Unknown);
                assert!(errors[&task_id].contains("scripted failure"));
                assert!(errors[&ghost].contains("not found"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        let extra = tokio::time::timeout(Duration::from_millis(100), h.events.recv()).await;
        assert!(extra.is_err(), "unexpected second reply: {extra:?}");
        h.shutdown.notify_one();
    }

    #[tokio::test]
    async fn test_crash_notice_becomes_termination() {
        let mut h = start(MockTaskController::new());
        let env_id = EnvironmentId::new();
        let task_id = acquire(&mut h, env_id).await;

        h.controller.crash(&task_id, 137);
        match next(&mut h).await {
            TaskEvent::TaskTerminated {
                task_id: id,
                exit_code,
                voluntary,
                ..
            } => {
                assert_eq!(id, task_id);
                assert_eq!(exit_code, 137);
                assert!(!voluntary);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        h.shutdown.notify_one();
    }
}
