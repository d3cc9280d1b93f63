// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Environment teardown.

use tracing::{info, warn};

use super::{CLEANUP_TRIGGERS, Environment, RUN_END_TIME_VAR, is_cleanup_trigger};
use crate::error::{Error, Result};
use crate::events::EnvironmentEvent;
use crate::hooks::WeightFilter;
use crate::ids::TaskId;
use crate::state::EnvState;

impl Environment {
    /// Release every task and fire the DESTROY and after_DESTROY hooks.
    /// The ids of the released tasks, which are still alive, are appended
    /// to `released`, also when the teardown fails.
    ///
    /// Task-hooks of the cleanup triggers are kept out of the first release
    /// and released only after their hooks ran.
    ///
    /// Without `force`, the environment must be in STANDBY, DEPLOYED, ERROR
    /// or DONE with no transition in flight, and a failed release aborts the
    /// teardown. With `force`, teardown waits for an in-flight transition
    /// and carries on past failures.
    pub async fn teardown(&self, force: bool, released: &mut Vec<TaskId>) -> Result<()> {
        let _guard = if force {
            self.transition_lock.lock().await
        } else {
            self.transition_lock.try_lock().map_err(|_| {
                Error::InvalidRequest(format!(
                    "cannot tear down environment {}: a transition is in progress",
                    self.id
                ))
            })?
        };

        let state = self.state();
        if !force
            && !matches!(
                state,
                EnvState::Standby | EnvState::Deployed | EnvState::Error | EnvState::Done
            )
        {
            return Err(Error::InvalidRequest(format!(
                "cannot tear down environment {} in state {state}",
                self.id
            )));
        }
        info!(env_id = %self.id, state = %state, force, "tearing down environment");

        let trigger = format!("leave_{state}");
        if let Err(e) = self.hooks.handle_hooks(self, &trigger, WeightFilter::All).await {
            warn!(env_id = %self.id, trigger = %trigger, error = %e, "hooks failed during teardown");
        }
        if state == EnvState::Running {
            self.stamp_if_empty(RUN_END_TIME_VAR);
        }
        self.cancel_auto_stop();

        let (cleanup_hooks, tasks): (Vec<_>, Vec<_>) = self
            .tasks()
            .into_iter()
            .partition(|t| t.hook_trigger.as_deref().is_some_and(is_cleanup_trigger));

        let tasks: Vec<TaskId> = tasks.into_iter().map(|t| t.task_id).collect();
        if let Err(e) = self.release_tasks(tasks, released).await {
            if !force {
                return Err(e);
            }
            warn!(env_id = %self.id, error = %e, "continuing forced teardown");
        }

        for trigger in CLEANUP_TRIGGERS {
            if let Err(e) = self.hooks.handle_hooks(self, trigger, WeightFilter::All).await {
                warn!(env_id = %self.id, trigger, error = %e, "cleanup hooks failed");
            }
        }

        let cleanup_hooks: Vec<TaskId> = cleanup_hooks.into_iter().map(|t| t.task_id).collect();
        if let Err(e) = self.release_tasks(cleanup_hooks, released).await {
            warn!(env_id = %self.id, error = %e, "failed to release cleanup hook tasks");
        }

        let cancelled = self.hooks.cancel_pending();
        if cancelled > 0 {
            info!(env_id = %self.id, cancelled, "cancelled pending calls");
        }
        self.publish(EnvironmentEvent::new(self.id, self.state(), "environment torn down"));
        Ok(())
    }
}
