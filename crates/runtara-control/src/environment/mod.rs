// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! A deployed workflow and its lifecycle.
//!
//! An [`Environment`] owns one role tree, the variables layered over it and
//! the hook engine that runs its call-hooks. Transitions are serialized per
//! environment: a second request while one is in flight fails fast instead
//! of queueing.
//!
//! Replies from the task coordinator reach the environment in two ways.
//! While a transition step waits, it holds a mailbox [`Subscription`] and
//! applies every event it receives. Everything else is applied by the
//! environment manager, which also starts
//! [`Environment::react_to_critical_failure`] when needed.
//!
//! [`Subscription`]: crate::coordinator::Subscription

mod teardown;
mod transition;
mod wait;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::coordinator::{EnvironmentMessage, Mailboxes, TaskCommand, TaskEvent};
use crate::error::{Error, Result};
use crate::events::{EnvironmentEvent, EventSink};
use crate::hooks::{CallHandler, Hook, HookEngine, HookHost};
use crate::ids::{EnvironmentId, TaskId};
use crate::state::{EnvState, Event};
use crate::workflow::{BoundTask, Role, Status, TaskInfo, TaskState};

/// Trigger fired once while an environment is torn down.
pub const DESTROY_TRIGGER: &str = "DESTROY";

/// Trigger fired after [`DESTROY_TRIGGER`] while an environment is torn down.
pub const AFTER_DESTROY_TRIGGER: &str = "after_DESTROY";

/// Cleanup triggers, in the order teardown fires them.
const CLEANUP_TRIGGERS: [&str; 2] = [DESTROY_TRIGGER, AFTER_DESTROY_TRIGGER];

fn is_cleanup_trigger(trigger: &str) -> bool {
    CLEANUP_TRIGGERS.contains(&trigger)
}

const RUN_NUMBER_VAR: &str = "run_number";
const RUN_NUMBER_ARG: &str = "runNumber";
const LAST_RUN_NUMBER_VAR: &str = "last_run_number";
const RUN_START_TIME_VAR: &str = "run_start_time_ms";
const RUN_START_COMPLETION_TIME_VAR: &str = "run_start_completion_time_ms";
const RUN_END_TIME_VAR: &str = "run_end_time_ms";
const RUN_END_COMPLETION_TIME_VAR: &str = "run_end_completion_time_ms";
const ENTER_STATE_TIME_VAR: &str = "enter_state_time_ms";
const CLEANUP_COUNT_VAR: &str = "__fmq_cleanup_count";
const ENVIRONMENT_ID_VAR: &str = "environment_id";
const AUTO_STOP_ENABLED_VAR: &str = "auto_stop_enabled";
const AUTO_STOP_TIMEOUT_VAR: &str = "auto_stop_timeout";

/// Collaborators shared by every environment of a manager.
#[derive(Clone)]
pub struct EnvironmentContext {
    /// Channel to the task coordinator.
    pub coordinator: mpsc::Sender<EnvironmentMessage>,
    /// Reply mailboxes.
    pub mailboxes: Mailboxes,
    /// Runs call-hooks.
    pub calls: Arc<dyn CallHandler>,
    /// Receives lifecycle events.
    pub sink: Arc<dyn EventSink>,
    /// Timeouts and delays.
    pub config: Arc<Config>,
    /// Next run number to hand out.
    pub run_counter: Arc<AtomicU32>,
    /// Initial global variables of every new environment.
    pub global_defaults: Arc<BTreeMap<String, String>>,
}

impl std::fmt::Debug for EnvironmentContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvironmentContext")
            .field("config", &self.config)
            .field("run_counter", &self.run_counter)
            .finish_non_exhaustive()
    }
}

/// A deployed workflow.
pub struct Environment {
    id: EnvironmentId,
    created_at: DateTime<Utc>,
    public: bool,
    workflow_ref: String,
    state: RwLock<EnvState>,
    current_transition: RwLock<Option<Event>>,
    transition_lock: tokio::sync::Mutex<()>,
    workflow: RwLock<Role>,
    user_vars: BTreeMap<String, String>,
    global_vars: RwLock<BTreeMap<String, String>>,
    run_number: AtomicU32,
    last_run_number: AtomicU32,
    hooks: HookEngine,
    ctx: EnvironmentContext,
    auto_stop: Mutex<Option<CancellationToken>>,
    this: Weak<Environment>,
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("id", &self.id)
            .field("workflow_ref", &self.workflow_ref)
            .field("state", &self.state())
            .field("run_number", &self.run_number())
            .finish_non_exhaustive()
    }
}

impl Environment {
    /// Create an environment in STANDBY around a finalized role tree.
    pub fn new(
        id: EnvironmentId,
        workflow_ref: impl Into<String>,
        workflow: Role,
        user_vars: BTreeMap<String, String>,
        public: bool,
        ctx: EnvironmentContext,
    ) -> Arc<Self> {
        let mut global_vars = (*ctx.global_defaults).clone();
        global_vars
            .entry(CLEANUP_COUNT_VAR.to_string())
            .or_insert_with(|| "0".to_string());
        let hooks = HookEngine::new(ctx.calls.clone(), ctx.config.hook_timeout);

        Arc::new_cyclic(|this| Self {
            id,
            created_at: Utc::now(),
            public,
            workflow_ref: workflow_ref.into(),
            state: RwLock::new(EnvState::Standby),
            current_transition: RwLock::new(None),
            transition_lock: tokio::sync::Mutex::new(()),
            workflow: RwLock::new(workflow),
            user_vars,
            global_vars: RwLock::new(global_vars),
            run_number: AtomicU32::new(0),
            last_run_number: AtomicU32::new(0),
            hooks,
            ctx,
            auto_stop: Mutex::new(None),
            this: this.clone(),
        })
    }

    /// Environment id.
    pub fn id(&self) -> EnvironmentId {
        self.id
    }

    /// Creation time.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Whether the environment was created as public.
    pub fn is_public(&self) -> bool {
        self.public
    }

    /// Workflow template the environment was loaded from.
    pub fn workflow_ref(&self) -> &str {
        &self.workflow_ref
    }

    /// Current state.
    pub fn state(&self) -> EnvState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Transition in flight, if any.
    pub fn current_transition(&self) -> Option<Event> {
        *self
            .current_transition
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Current run number, 0 outside a run.
    pub fn run_number(&self) -> u32 {
        self.run_number.load(Ordering::SeqCst)
    }

    /// Number of the last run that was stopped, 0 if none.
    pub fn last_run_number(&self) -> u32 {
        self.last_run_number.load(Ordering::SeqCst)
    }

    /// Overwrite the state without running a transition. Used when a
    /// failure leaves no legal way into ERROR.
    pub fn force_state(&self, state: EnvState) {
        let previous = std::mem::replace(
            &mut *self.state.write().unwrap_or_else(PoisonError::into_inner),
            state,
        );
        warn!(env_id = %self.id, from = %previous, to = %state, "environment state forced");
        self.publish(EnvironmentEvent::new(self.id, state, "state forced"));
    }

    /// Snapshot of the role tree.
    pub fn workflow(&self) -> Role {
        self.read_workflow().clone()
    }

    /// Bound tasks, task-hooks included.
    pub fn tasks(&self) -> Vec<TaskInfo> {
        self.read_workflow().tasks()
    }

    /// Ids of every bound task.
    pub fn task_ids(&self) -> Vec<TaskId> {
        self.tasks().into_iter().map(|t| t.task_id).collect()
    }

    /// Exclusive resource classes claimed by the role tree.
    pub fn resource_classes(&self) -> std::collections::BTreeSet<String> {
        self.read_workflow().resource_classes()
    }

    /// Runtime variable set on the root role.
    pub fn runtime_var(&self, key: &str) -> Option<String> {
        self.read_workflow().runtime_var(key).map(str::to_string)
    }

    /// Global variable of this environment.
    pub fn global_var(&self, key: &str) -> Option<String> {
        self.global_vars
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Variables as seen at the root role.
    pub fn vars(&self) -> BTreeMap<String, String> {
        let workflow = self.read_workflow();
        workflow.vars_for(workflow.path(), &self.base_vars())
    }

    /// Calls started by hooks and not yet awaited.
    pub fn pending_calls(&self) -> usize {
        self.hooks.pending_count()
    }

    /// React to a critical task failure reported outside any transition.
    ///
    /// Waits for the configured delay, then tries GO_ERROR. If ERROR had to
    /// be forced, the tasks still running are stopped.
    pub async fn react_to_critical_failure(&self) {
        warn!(env_id = %self.id, state = %self.state(), "critical task failed outside a transition");
        tokio::time::sleep(self.ctx.config.reaction_delay).await;
        if !self.go_error().await {
            return;
        }

        let running = self.task_ids_in(TaskState::Running);
        if running.is_empty() {
            return;
        }
        let message = EnvironmentMessage::TransitionTasks {
            env_id: self.id,
            tasks: running,
            src: TaskState::Running,
            event: TaskCommand::Stop,
            dst: TaskState::Configured,
            args: BTreeMap::new(),
        };
        if let Err(e) = self.send(message).await {
            warn!(env_id = %self.id, error = %e, "failed to stop surviving tasks");
        }
    }

    /// Try GO_ERROR. A transition in flight is waited for first, so its
    /// commit cannot overwrite ERROR. An illegal GO_ERROR only warns; any
    /// other failure forces ERROR. Returns whether ERROR was forced.
    pub async fn go_error(&self) -> bool {
        loop {
            match self.transition(Event::GoError).await {
                Ok(_) => return false,
                Err(Error::TransitionInProgress { .. }) => {
                    debug!(env_id = %self.id, "waiting for the transition in flight before GO_ERROR");
                    drop(self.transition_lock.lock().await);
                }
                Err(e @ Error::InvalidTransition { .. }) => {
                    warn!(env_id = %self.id, error = %e, "GO_ERROR not applicable");
                    return false;
                }
                Err(e) => {
                    warn!(env_id = %self.id, error = %e, "GO_ERROR failed, forcing ERROR");
                    self.force_state(EnvState::Error);
                    return true;
                }
            }
        }
    }

    /// Fold a coordinator event into the role tree. Returns whether it put a
    /// critical, non-hook task into ERROR or terminated one.
    pub fn apply_event(&self, event: &TaskEvent) -> bool {
        let mut workflow = self.write_workflow();
        match event {
            TaskEvent::TaskStatusChanged {
                role_path,
                task_id,
                hostname,
                status,
                ..
            } => {
                if *status == Status::Active
                    && let Some(task_id) = task_id
                {
                    let bound = BoundTask {
                        task_id: task_id.clone(),
                        hostname: hostname.clone().unwrap_or_default(),
                    };
                    if let Err(e) = workflow.bind_task(role_path, bound) {
                        warn!(env_id = %self.id, role_path = %role_path, error = %e, "cannot bind task");
                        return false;
                    }
                }
                if let Err(e) = workflow.set_role_status(role_path, *status) {
                    warn!(env_id = %self.id, role_path = %role_path, error = %e, "status for unknown role");
                }
                false
            }
            TaskEvent::TasksStateChanged { states, errors, .. } => {
                let mut critical = false;
                for (task_id, state) in states {
                    if !workflow.set_task_state(task_id, *state) {
                        continue;
                    }
                    if *state != TaskState::Error {
                        continue;
                    }
                    let error = errors.get(task_id);
                    match task_info(&workflow, task_id) {
                        Some(info) if info.critical && !info.is_hook() => critical = true,
                        Some(info) => {
                            warn!(env_id = %self.id, role_path = %info.role_path, error = ?error, "non-critical task in ERROR");
                        }
                        None => {}
                    }
                }
                critical
            }
            TaskEvent::TasksReleased {
                task_ids, errors, ..
            } => {
                for task_id in task_ids.iter().filter(|id| !errors.contains_key(*id)) {
                    workflow.unbind_task(task_id);
                }
                false
            }
            TaskEvent::TaskTerminated {
                task_id,
                exit_code,
                voluntary,
                stdout,
                stderr,
                ..
            } => {
                let state = if *voluntary && *exit_code == 0 {
                    TaskState::Done
                } else {
                    TaskState::Error
                };
                workflow.set_task_state(task_id, state);
                let Some(info) = task_info(&workflow, task_id) else {
                    debug!(env_id = %self.id, task_id = %task_id, "termination of unknown task");
                    return false;
                };
                if let Some(role) = workflow.find_mut(&info.role_path) {
                    role.set_runtime_vars([
                        ("taskResult.exitCode", exit_code.to_string()),
                        ("taskResult.stdout", stdout.clone()),
                        ("taskResult.stderr", stderr.clone()),
                        ("taskResult.voluntary", voluntary.to_string()),
                        ("taskResult.timestamp", now_ms()),
                    ]);
                }
                if info.is_hook() {
                    return false;
                }
                if !info.critical {
                    warn!(env_id = %self.id, role_path = %info.role_path, exit_code, "non-critical task terminated");
                }
                info.critical
            }
        }
    }

    fn read_workflow(&self) -> RwLockReadGuard<'_, Role> {
        self.workflow.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_workflow(&self) -> RwLockWriteGuard<'_, Role> {
        self.workflow.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Global, then user variables, then the environment id.
    fn base_vars(&self) -> BTreeMap<String, String> {
        let mut vars = self
            .global_vars
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        vars.extend(self.user_vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        vars.insert(ENVIRONMENT_ID_VAR.to_string(), self.id.to_string());
        vars
    }

    fn set_global_var(&self, key: &str, value: String) {
        self.global_vars
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value);
    }

    fn set_root_vars<'a>(&self, vars: impl IntoIterator<Item = (&'a str, String)>) {
        self.write_workflow().set_runtime_vars(vars);
    }

    /// Set a root runtime variable unless it already holds a value.
    fn stamp_if_empty(&self, key: &str) {
        let mut workflow = self.write_workflow();
        if workflow.runtime_var(key).is_none_or(str::is_empty) {
            workflow.set_runtime_vars([(key, now_ms())]);
        } else {
            debug!(env_id = %self.id, var = key, "already set");
        }
    }

    /// Non-hook tasks in `state`.
    fn task_ids_in(&self, state: TaskState) -> Vec<TaskId> {
        self.tasks()
            .into_iter()
            .filter(|t| !t.is_hook() && t.state == state)
            .map(|t| t.task_id)
            .collect()
    }

    async fn send(&self, message: EnvironmentMessage) -> Result<()> {
        let kind = message.kind();
        self.ctx
            .coordinator
            .send(message)
            .await
            .map_err(|_| Error::Coordination(format!("task coordinator unavailable for {kind}")))
    }

    fn publish(&self, event: EnvironmentEvent) {
        self.ctx
            .sink
            .publish(event.with_run_number(self.run_number()));
    }

    fn lock_auto_stop(&self) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
        self.auto_stop.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Arm the auto-stop timer for the current run when the environment
    /// asks for it.
    fn arm_auto_stop(&self) {
        let vars = self.vars();
        if vars.get(AUTO_STOP_ENABLED_VAR).map(String::as_str) != Some("true") {
            return;
        }
        let Some(raw) = vars.get(AUTO_STOP_TIMEOUT_VAR).filter(|v| !v.is_empty()) else {
            return;
        };
        let Some(timeout) = crate::config::parse_duration(raw) else {
            warn!(env_id = %self.id, value = %raw, "invalid auto stop timeout");
            return;
        };

        let token = CancellationToken::new();
        if let Some(previous) = self.lock_auto_stop().replace(token.clone()) {
            previous.cancel();
        }
        let run = self.run_number();
        let env = self.this.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    if let Some(env) = env.upgrade() {
                        env.auto_stop(run, timeout).await;
                    }
                }
            }
        });
        info!(env_id = %self.id, run_number = run, timeout = ?timeout, "auto stop scheduled");
    }

    fn cancel_auto_stop(&self) {
        if let Some(token) = self.lock_auto_stop().take() {
            token.cancel();
        }
    }

    async fn auto_stop(&self, run: u32, timeout: Duration) {
        if self.state() != EnvState::Running || self.run_number() != run {
            return;
        }
        info!(env_id = %self.id, run_number = run, timeout = ?timeout, "executing scheduled auto stop");
        match self.transition(Event::StopActivity).await {
            Ok(_) => {}
            Err(e @ Error::TransitionInProgress { .. }) => {
                info!(env_id = %self.id, run_number = run, error = %e, "auto stop skipped");
            }
            Err(e) => {
                warn!(env_id = %self.id, run_number = run, error = %e, "auto stop failed");
                self.go_error().await;
            }
        }
    }
}

#[async_trait]
impl HookHost for Environment {
    fn env_id(&self) -> EnvironmentId {
        self.id
    }

    fn hooks_for_trigger(&self, trigger: &str) -> BTreeMap<i32, Vec<Hook>> {
        self.read_workflow().hooks_for_trigger(trigger)
    }

    fn vars_for(&self, role_path: &str) -> BTreeMap<String, String> {
        self.read_workflow().vars_for(role_path, &self.base_vars())
    }

    fn set_runtime_var(&self, role_path: &str, key: &str, value: String) {
        match self.write_workflow().find_mut(role_path) {
            Some(role) => role.set_runtime_vars([(key, value)]),
            None => warn!(env_id = %self.id, role_path = %role_path, "runtime var for unknown role"),
        }
    }

    async fn run_task_hooks(
        &self,
        trigger: &str,
        hooks: &[Hook],
    ) -> Vec<std::result::Result<(), String>> {
        self.await_task_hooks(trigger, hooks).await
    }
}

fn task_info(workflow: &Role, task_id: &TaskId) -> Option<TaskInfo> {
    workflow.tasks().into_iter().find(|t| &t.task_id == task_id)
}

fn now_ms() -> String {
    Utc::now().timestamp_millis().to_string()
}
