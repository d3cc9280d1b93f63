// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Environment transitions.
//!
//! ```text
//! before_<EVENT>  ->  leave_<FROM>  ->  do()  ->  commit  ->  enter_<TO>  ->  after_<EVENT>
//! ```
//!
//! Each phase runs its negative-weight hooks, then the environment's own
//! bookkeeping for that phase, then the remaining hooks. A failure up to and
//! including `do()` cancels the transition. After the commit, failures are
//! reported but the new state stands.

use std::collections::BTreeMap;
use std::sync::PoisonError;
use std::sync::atomic::Ordering;

use tracing::{info, warn};

use super::{
    CLEANUP_COUNT_VAR, ENTER_STATE_TIME_VAR, Environment, LAST_RUN_NUMBER_VAR, RUN_END_COMPLETION_TIME_VAR,
    RUN_END_TIME_VAR, RUN_NUMBER_ARG, RUN_NUMBER_VAR, RUN_START_COMPLETION_TIME_VAR, RUN_START_TIME_VAR,
    now_ms,
};
use crate::coordinator::{EnvironmentMessage, TaskCommand};
use crate::error::{Error, Result};
use crate::events::EnvironmentEvent;
use crate::hooks::WeightFilter;
use crate::state::{EnvState, Event};
use crate::workflow::TaskState;

impl Environment {
    /// Run `event`. Returns the state reached.
    ///
    /// Fails with [`Error::TransitionInProgress`] while another transition
    /// holds the environment, and with [`Error::InvalidTransition`] when the
    /// event is not allowed from the current state. Neither has side effects.
    pub async fn transition(&self, event: Event) -> Result<EnvState> {
        let Ok(_guard) = self.transition_lock.try_lock() else {
            return Err(Error::TransitionInProgress { event });
        };
        let from = self.state();
        let Some(to) = from.next(event) else {
            return Err(Error::InvalidTransition { event, state: from });
        };

        self.set_current_transition(Some(event));
        info!(env_id = %self.id, event = %event, from = %from, to = %to, "transition starting");
        self.publish(EnvironmentEvent::new(self.id, from, "transition starting").in_transition(event, event.as_str()));

        let result = self.run_phases(event, from, to).await;
        self.set_current_transition(None);

        let state = self.state();
        match &result {
            Ok(()) => {
                info!(env_id = %self.id, event = %event, state = %state, "transition complete");
                let mut published = EnvironmentEvent::new(self.id, state, "transition complete")
                    .in_transition(event, event.as_str());
                published.vars = self.run_vars();
                self.publish(published);
            }
            Err(e) => {
                warn!(env_id = %self.id, event = %event, state = %state, error = %e, "transition failed");
                self.publish(
                    EnvironmentEvent::new(self.id, state, "transition failed")
                        .in_transition(event, event.as_str())
                        .with_error(e.to_string()),
                );
            }
        }
        result.map(|()| state)
    }

    async fn run_phases(&self, event: Event, from: EnvState, to: EnvState) -> Result<()> {
        if let Err(e) = self.prepare(event, from).await {
            if event == Event::StartActivity {
                self.abort_run();
            }
            return Err(e);
        }

        *self.state.write().unwrap_or_else(PoisonError::into_inner) = to;

        let entered = self.enter_state(event, to).await;
        let finished = self.after_event(event).await;
        entered.and(finished)
    }

    /// Everything before the commit: `before_`, `leave_` and `do()`.
    async fn prepare(&self, event: Event, from: EnvState) -> Result<()> {
        let trigger = format!("before_{event}");
        self.phase(event, &trigger, WeightFilter::Negative).await?;
        self.before_step(event);
        self.phase(event, &trigger, WeightFilter::NonNegative).await?;

        let trigger = format!("leave_{from}");
        self.phase(event, &trigger, WeightFilter::Negative).await?;
        if from == EnvState::Running {
            self.stamp_if_empty(RUN_END_TIME_VAR);
        }
        self.phase(event, &trigger, WeightFilter::NonNegative).await?;

        let step = self.perform(event).await;
        let mut published = EnvironmentEvent::new(self.id, self.state(), "transition step finished")
            .in_transition(event, event.as_str());
        if let Err(e) = &step {
            published = published.with_error(e.to_string());
        }
        self.publish(published);
        step
    }

    async fn enter_state(&self, event: Event, to: EnvState) -> Result<()> {
        let trigger = format!("enter_{to}");
        let negative = self.phase(event, &trigger, WeightFilter::Negative).await;
        self.set_root_vars([(ENTER_STATE_TIME_VAR, now_ms())]);
        let non_negative = self.phase(event, &trigger, WeightFilter::NonNegative).await;
        negative.and(non_negative)
    }

    async fn after_event(&self, event: Event) -> Result<()> {
        let trigger = format!("after_{event}");
        let negative = self.phase(event, &trigger, WeightFilter::Negative).await;
        self.after_step(event);
        let non_negative = self.phase(event, &trigger, WeightFilter::NonNegative).await;
        negative.and(non_negative)
    }

    async fn phase(&self, event: Event, trigger: &str, filter: WeightFilter) -> Result<()> {
        let result = self.hooks.handle_hooks(self, trigger, filter).await;
        if let Err(e) = &result {
            self.publish(
                EnvironmentEvent::new(self.id, self.state(), "transition step finished")
                    .in_transition(event, trigger)
                    .with_error(e.to_string()),
            );
        }
        result
    }

    /// Run bookkeeping between the negative and the remaining `before_` hooks.
    fn before_step(&self, event: Event) {
        match event {
            Event::StartActivity => {
                let run = self.ctx.run_counter.fetch_add(1, Ordering::SeqCst);
                self.run_number.store(run, Ordering::SeqCst);
                self.set_root_vars([
                    (RUN_NUMBER_VAR, run.to_string()),
                    (RUN_NUMBER_ARG, run.to_string()),
                    (RUN_START_TIME_VAR, now_ms()),
                    (RUN_START_COMPLETION_TIME_VAR, String::new()),
                    (RUN_END_TIME_VAR, String::new()),
                    (RUN_END_COMPLETION_TIME_VAR, String::new()),
                ]);
                // an unparsable counter still signals that cleanup is due
                let count = self
                    .global_var(CLEANUP_COUNT_VAR)
                    .filter(|v| !v.is_empty())
                    .map(|v| v.parse::<u64>().unwrap_or(1))
                    .unwrap_or(0);
                self.set_global_var(CLEANUP_COUNT_VAR, count.to_string());
                info!(env_id = %self.id, run_number = run, "run number assigned");
            }
            Event::StopActivity => self.stamp_if_empty(RUN_END_TIME_VAR),
            Event::GoError => self.set_root_vars([(RUN_END_TIME_VAR, now_ms())]),
            _ => {}
        }
    }

    /// Run bookkeeping between the negative and the remaining `after_` hooks.
    fn after_step(&self, event: Event) {
        match event {
            Event::StartActivity => {
                let count = self
                    .global_var(CLEANUP_COUNT_VAR)
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(0);
                self.set_global_var(CLEANUP_COUNT_VAR, (count + 1).to_string());
                self.arm_auto_stop();
                self.set_root_vars([(RUN_START_COMPLETION_TIME_VAR, now_ms())]);
            }
            Event::StopActivity => {
                self.set_root_vars([(RUN_END_COMPLETION_TIME_VAR, now_ms())]);
                self.cancel_auto_stop();
                self.end_run();
            }
            Event::GoError => {
                self.set_root_vars([(RUN_END_COMPLETION_TIME_VAR, now_ms())]);
                self.cancel_auto_stop();
                self.end_run();
            }
            _ => {}
        }
    }

    /// Move the current run number to `last_run_number`.
    fn end_run(&self) {
        let run = self.run_number.swap(0, Ordering::SeqCst);
        if run == 0 {
            return;
        }
        self.last_run_number.store(run, Ordering::SeqCst);
        self.set_root_vars([
            (LAST_RUN_NUMBER_VAR, run.to_string()),
            (RUN_NUMBER_VAR, String::new()),
            (RUN_NUMBER_ARG, String::new()),
        ]);
    }

    fn abort_run(&self) {
        self.run_number.store(0, Ordering::SeqCst);
        self.set_root_vars([(RUN_NUMBER_VAR, String::new()), (RUN_NUMBER_ARG, String::new())]);
    }

    /// The event's own work on the tasks.
    async fn perform(&self, event: Event) -> Result<()> {
        match event {
            Event::Deploy => self.acquire_tasks().await,
            Event::Configure => {
                let tasks = self.non_hook_task_ids();
                let message = EnvironmentMessage::ConfigureTasks {
                    env_id: self.id,
                    tasks: tasks.clone(),
                    args: self.vars(),
                };
                self.await_tasks(message, tasks, TaskState::Configured).await
            }
            Event::StartActivity => {
                let args = BTreeMap::from([(RUN_NUMBER_ARG.to_string(), self.run_number().to_string())]);
                self.drive_tasks(TaskState::Configured, TaskCommand::Start, TaskState::Running, args)
                    .await
            }
            Event::StopActivity => {
                self.drive_tasks(TaskState::Running, TaskCommand::Stop, TaskState::Configured, BTreeMap::new())
                    .await
            }
            Event::Reset => {
                self.drive_tasks(TaskState::Configured, TaskCommand::Reset, TaskState::Standby, BTreeMap::new())
                    .await?;
                self.drive_tasks(TaskState::Error, TaskCommand::Recover, TaskState::Standby, BTreeMap::new())
                    .await
            }
            Event::GoError => {
                let stopped = self
                    .drive_tasks(TaskState::Running, TaskCommand::Stop, TaskState::Configured, BTreeMap::new())
                    .await;
                if let Err(e) = stopped {
                    warn!(env_id = %self.id, error = %e, "failed to stop running tasks on GO_ERROR");
                }
                Ok(())
            }
            Event::Exit => {
                self.drive_tasks(TaskState::Standby, TaskCommand::Exit, TaskState::Done, BTreeMap::new())
                    .await?;
                self.drive_tasks(TaskState::Configured, TaskCommand::Exit, TaskState::Done, BTreeMap::new())
                    .await
            }
        }
    }

    /// Send `command` to the non-hook tasks in `src` and wait for `dst`.
    async fn drive_tasks(
        &self,
        src: TaskState,
        command: TaskCommand,
        dst: TaskState,
        args: BTreeMap<String, String>,
    ) -> Result<()> {
        let tasks = self.task_ids_in(src);
        let message = EnvironmentMessage::TransitionTasks {
            env_id: self.id,
            tasks: tasks.clone(),
            src,
            event: command,
            dst,
            args,
        };
        self.await_tasks(message, tasks, dst).await
    }

    fn non_hook_task_ids(&self) -> Vec<crate::ids::TaskId> {
        self.tasks()
            .into_iter()
            .filter(|t| !t.is_hook())
            .map(|t| t.task_id)
            .collect()
    }

    fn set_current_transition(&self, event: Option<Event>) {
        *self
            .current_transition
            .write()
            .unwrap_or_else(PoisonError::into_inner) = event;
    }

    /// Run timestamps and numbers, exported with transition events.
    fn run_vars(&self) -> BTreeMap<String, String> {
        let workflow = self.read_workflow();
        [
            RUN_NUMBER_VAR,
            LAST_RUN_NUMBER_VAR,
            RUN_START_TIME_VAR,
            RUN_START_COMPLETION_TIME_VAR,
            RUN_END_TIME_VAR,
            RUN_END_COMPLETION_TIME_VAR,
        ]
        .into_iter()
        .filter_map(|key| {
            workflow
                .runtime_var(key)
                .filter(|v| !v.is_empty())
                .map(|v| (key.to_string(), v.to_string()))
        })
        .collect()
    }
}
