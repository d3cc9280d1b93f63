// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The environment manager: the control API.
//!
//! Owns the registry of live environments and the collaborators every
//! environment shares. The registry lock only guards bookkeeping and is
//! never held across an await.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::AtomicU32;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::coordinator::{EnvironmentMessage, Mailboxes, TaskEvent};
use crate::environment::{Environment, EnvironmentContext};
use crate::error::{Error, Result};
use crate::events::{EnvironmentEvent, EventSink};
use crate::hooks::CallHandler;
use crate::ids::{EnvironmentId, TaskId};
use crate::state::{EnvState, Event};
use crate::workflow::{WorkflowLoader, apply_role_vars};

/// Creates, drives and destroys environments.
pub struct EnvironmentManager {
    environments: RwLock<HashMap<EnvironmentId, Arc<Environment>>>,
    loader: Arc<dyn WorkflowLoader>,
    ctx: EnvironmentContext,
}

impl std::fmt::Debug for EnvironmentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvironmentManager")
            .field("environments", &self.ids())
            .field("ctx", &self.ctx)
            .finish_non_exhaustive()
    }
}

impl EnvironmentManager {
    /// Create a manager.
    ///
    /// # Arguments
    ///
    /// * `coordinator` - Channel to the task coordinator
    /// * `mailboxes` - Reply mailboxes, shared with the event router
    /// * `loader` - Source of workflow templates
    /// * `calls` - Runs call-hooks
    /// * `sink` - Receives lifecycle events
    /// * `config` - Timeouts, delays and the first run number
    pub fn new(
        coordinator: mpsc::Sender<EnvironmentMessage>,
        mailboxes: Mailboxes,
        loader: Arc<dyn WorkflowLoader>,
        calls: Arc<dyn CallHandler>,
        sink: Arc<dyn EventSink>,
        config: Config,
    ) -> Self {
        let run_counter = Arc::new(AtomicU32::new(config.first_run_number));
        Self {
            environments: RwLock::new(HashMap::new()),
            loader,
            ctx: EnvironmentContext {
                coordinator,
                mailboxes,
                calls,
                sink,
                config: Arc::new(config),
                run_counter,
                global_defaults: Arc::new(BTreeMap::new()),
            },
        }
    }

    /// Set the global variables every new environment starts with.
    pub fn with_global_vars(mut self, vars: BTreeMap<String, String>) -> Self {
        self.ctx.global_defaults = Arc::new(vars);
        self
    }

    /// Configuration in use.
    pub fn config(&self) -> &Config {
        &self.ctx.config
    }

    // ========================================================================
    // Control API
    // ========================================================================

    /// Load `workflow_ref`, register a new environment and bring it to
    /// CONFIGURED.
    ///
    /// Keys of `vars` shaped `<role path>:<name>` are set on that role; the
    /// rest become environment variables. An environment whose exclusive
    /// resource classes overlap a live one is never registered. When DEPLOY
    /// or CONFIGURE fails, the environment is moved to ERROR, torn down,
    /// its tasks are killed and it is unregistered.
    pub async fn create_environment(
        &self,
        workflow_ref: &str,
        vars: BTreeMap<String, String>,
        public: bool,
    ) -> Result<EnvironmentId> {
        let claimed = self.claimed_resources();
        let mut workflow = self.loader.load(workflow_ref, &vars).await?;
        let env_vars = apply_role_vars(&mut workflow, &vars)?;

        let classes = workflow.resource_classes();
        check_conflicts(&classes, &claimed)?;

        let id = EnvironmentId::new();
        let env = Environment::new(id, workflow_ref, workflow, env_vars, public, self.ctx.clone());
        {
            let mut environments = self.write_environments();
            // another environment may have claimed a class since the snapshot
            let current = claims(&environments);
            check_conflicts(&classes, &current)?;
            environments.insert(id, env.clone());
        }
        info!(env_id = %id, workflow_ref = %workflow_ref, public, "environment created");
        self.ctx
            .sink
            .publish(EnvironmentEvent::new(id, env.state(), "environment created"));

        for event in [Event::Deploy, Event::Configure] {
            if let Err(e) = env.transition(event).await {
                let e = e.in_environment(id, event.as_str(), env.state());
                warn!(env_id = %id, error = %e, "environment creation failed, cleaning up");
                self.abort_creation(&env).await;
                return Err(e);
            }
        }
        Ok(id)
    }

    /// Run `event` on the environment. Returns the state reached.
    pub async fn control_environment(&self, id: EnvironmentId, event: Event) -> Result<EnvState> {
        let env = self.environment(id)?;
        env.transition(event)
            .await
            .map_err(|e| e.in_environment(id, event.as_str(), env.state()))
    }

    /// Stop and reset the environment if needed, tear it down and
    /// unregister it. Released tasks are killed unless `keep_tasks` is set.
    ///
    /// A failed teardown is retried once with `force`.
    pub async fn destroy_environment(
        &self,
        id: EnvironmentId,
        force: bool,
        keep_tasks: bool,
    ) -> Result<()> {
        let env = self.environment(id)?;

        if env.state() == EnvState::Running
            && let Err(e) = env.transition(Event::StopActivity).await
        {
            warn!(env_id = %id, error = %e, "STOP_ACTIVITY before destroy failed");
        }
        if env.state() == EnvState::Configured
            && let Err(e) = env.transition(Event::Reset).await
        {
            warn!(env_id = %id, error = %e, "RESET before destroy failed");
        }

        let mut released = Vec::new();
        match env.teardown(force, &mut released).await {
            Ok(()) => {}
            Err(e) if !force => {
                warn!(env_id = %id, error = %e, "teardown failed, retrying with force");
                env.teardown(true, &mut released)
                    .await
                    .map_err(|e| e.in_environment(id, "teardown", env.state()))?;
            }
            Err(e) => return Err(e.in_environment(id, "teardown", env.state())),
        }

        if !keep_tasks {
            self.kill_tasks(&env, released).await;
        }
        self.unregister(id);
        self.ctx
            .sink
            .publish(EnvironmentEvent::new(id, env.state(), "environment destroyed"));
        info!(env_id = %id, keep_tasks, "environment destroyed");
        Ok(())
    }

    // ========================================================================
    // Listing
    // ========================================================================

    /// Ids of the live environments, sorted.
    pub fn ids(&self) -> Vec<EnvironmentId> {
        let mut ids: Vec<EnvironmentId> = self.read_environments().keys().copied().collect();
        ids.sort();
        ids
    }

    /// A live environment.
    pub fn environment(&self, id: EnvironmentId) -> Result<Arc<Environment>> {
        self.read_environments()
            .get(&id)
            .cloned()
            .ok_or(Error::EnvironmentNotFound(id))
    }

    /// Exclusive resource classes claimed by live environments.
    pub fn claimed_resources(&self) -> BTreeMap<String, EnvironmentId> {
        claims(&self.read_environments())
    }

    // ========================================================================
    // Coordinator events
    // ========================================================================

    /// Apply an event nobody was waiting for. A critical task failure starts
    /// the environment's reaction in the background.
    pub fn handle_task_event(&self, event: TaskEvent) {
        let env_id = event.env_id();
        let Ok(env) = self.environment(env_id) else {
            debug!(env_id = %env_id, "event for unknown environment");
            return;
        };
        if env.apply_event(&event) {
            tokio::spawn(async move { env.react_to_critical_failure().await });
        }
    }

    async fn abort_creation(&self, env: &Arc<Environment>) {
        let id = env.id();
        env.go_error().await;
        let mut released = Vec::new();
        if let Err(e) = env.teardown(true, &mut released).await {
            warn!(env_id = %id, error = %e, "forced teardown failed");
        }
        self.kill_tasks(env, released).await;
        self.unregister(id);
    }

    /// Kill `released` plus whatever is still bound. Also drops the
    /// environment's pending descriptors.
    async fn kill_tasks(&self, env: &Environment, mut released: Vec<TaskId>) {
        released.extend(env.task_ids());
        let message = EnvironmentMessage::KillTasks {
            env_id: env.id(),
            tasks: released,
        };
        if self.ctx.coordinator.send(message).await.is_err() {
            warn!(env_id = %env.id(), "task coordinator unavailable, tasks not killed");
        }
    }

    fn unregister(&self, id: EnvironmentId) {
        self.write_environments().remove(&id);
    }

    fn read_environments(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<EnvironmentId, Arc<Environment>>> {
        self.environments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_environments(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<EnvironmentId, Arc<Environment>>> {
        self.environments
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn claims(environments: &HashMap<EnvironmentId, Arc<Environment>>) -> BTreeMap<String, EnvironmentId> {
    environments
        .iter()
        .flat_map(|(id, env)| env.resource_classes().into_iter().map(move |class| (class, *id)))
        .collect()
}

fn check_conflicts(
    classes: &std::collections::BTreeSet<String>,
    claimed: &BTreeMap<String, EnvironmentId>,
) -> Result<()> {
    let overlap: Vec<String> = classes
        .iter()
        .filter(|class| claimed.contains_key(*class))
        .cloned()
        .collect();
    if overlap.is_empty() {
        Ok(())
    } else {
        Err(Error::ResourceConflict { classes: overlap })
    }
}
