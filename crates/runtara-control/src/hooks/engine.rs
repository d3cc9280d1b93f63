// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hook scheduling for one environment.
//!
//! For a trigger, the engine walks the weights of every hook registered on
//! it plus every call pending await on it, in ascending order. At each
//! weight it starts the call-hooks, awaits the calls due at that point, runs
//! the task-hooks, and stops after the first weight that produced a critical
//! failure.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::call::{CallHandler, CallRequest, PendingCall};
use super::{Hook, HookKind};
use crate::error::{Error, Result};
use crate::ids::EnvironmentId;

/// Which weights of a trigger to process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightFilter {
    /// Every weight.
    All,
    /// Weights below zero.
    Negative,
    /// Weights zero and above.
    NonNegative,
}

impl WeightFilter {
    fn admits(self, weight: i32) -> bool {
        match self {
            WeightFilter::All => true,
            WeightFilter::Negative => weight < 0,
            WeightFilter::NonNegative => weight >= 0,
        }
    }
}

/// The environment side of hook execution: where hooks come from, what vars
/// they see and how task-hooks are run.
#[async_trait]
pub trait HookHost: Send + Sync {
    /// Owning environment.
    fn env_id(&self) -> EnvironmentId;

    /// Hooks registered for `trigger`, grouped by weight, ties in tree order.
    fn hooks_for_trigger(&self, trigger: &str) -> BTreeMap<i32, Vec<Hook>>;

    /// Variables visible to the role at `role_path`.
    fn vars_for(&self, role_path: &str) -> BTreeMap<String, String>;

    /// Store a call output in a runtime variable of the role at `role_path`.
    fn set_runtime_var(&self, role_path: &str, key: &str, value: String);

    /// Run task-hooks to completion. Returns one result per hook, in order.
    async fn run_task_hooks(&self, trigger: &str, hooks: &[Hook]) -> Vec<std::result::Result<(), String>>;
}

type PendingByWeight = BTreeMap<i32, Vec<PendingCall>>;

/// Runs hooks and keeps the calls pending await across transitions.
pub struct HookEngine {
    calls: Arc<dyn CallHandler>,
    default_timeout: Duration,
    pending: Mutex<HashMap<String, PendingByWeight>>,
}

impl std::fmt::Debug for HookEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookEngine")
            .field("default_timeout", &self.default_timeout)
            .field("pending", &self.pending_count())
            .finish()
    }
}

/// A failed hook.
struct Failure {
    critical: bool,
    message: String,
}

impl HookEngine {
    /// Engine running calls through `calls`. Hooks without a timeout get `default_timeout`.
    pub fn new(calls: Arc<dyn CallHandler>, default_timeout: Duration) -> Self {
        Self {
            calls,
            default_timeout,
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingByWeight>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of calls started but not yet awaited.
    pub fn pending_count(&self) -> usize {
        self.lock_pending()
            .values()
            .flat_map(BTreeMap::values)
            .map(Vec::len)
            .sum()
    }

    /// Cancel and forget every pending call. Returns how many calls were
    /// cancelled by this invocation.
    pub fn cancel_pending(&self) -> usize {
        let drained: Vec<PendingCall> = self
            .lock_pending()
            .drain()
            .flat_map(|(_, by_weight)| by_weight.into_values().flatten())
            .collect();
        drained.iter().filter(|call| call.cancel()).count()
    }

    /// Process the hooks of `trigger` whose weight passes `filter`.
    pub async fn handle_hooks(
        &self,
        host: &dyn HookHost,
        trigger: &str,
        filter: WeightFilter,
    ) -> Result<()> {
        let env_id = host.env_id();
        let mut hooks = host.hooks_for_trigger(trigger);

        let pending_weights: BTreeSet<i32> = self
            .lock_pending()
            .get(trigger)
            .map(|by_weight| by_weight.keys().copied().collect())
            .unwrap_or_default();
        let weights: BTreeSet<i32> = hooks
            .keys()
            .copied()
            .chain(pending_weights)
            .filter(|w| filter.admits(*w))
            .collect();
        if weights.is_empty() {
            return Ok(());
        }
        debug!(env_id = %env_id, trigger = %trigger, weights = ?weights, "handling hooks");

        let mut failures = Vec::new();
        for weight in weights {
            let at_weight = hooks.remove(&weight).unwrap_or_default();
            let (calls, tasks): (Vec<Hook>, Vec<Hook>) = at_weight
                .into_iter()
                .partition(|h| matches!(h.kind, HookKind::Call { .. }));

            for hook in &calls {
                self.start_call(host, hook);
            }

            let due = self
                .lock_pending()
                .get_mut(trigger)
                .and_then(|by_weight| by_weight.remove(&weight))
                .unwrap_or_default();
            let mut step_failures = self.await_calls(host, due).await;

            if !tasks.is_empty() {
                let results = host.run_task_hooks(trigger, &tasks).await;
                for (hook, result) in tasks.iter().zip(results) {
                    if let Err(message) = result {
                        step_failures.push(Failure {
                            critical: hook.traits.critical,
                            message,
                        });
                    }
                }
            }

            let critical = step_failures.iter().any(|f| f.critical);
            failures.extend(step_failures);
            if critical {
                break;
            }
        }

        let mut critical = Vec::new();
        for failure in failures {
            if failure.critical {
                error!(env_id = %env_id, trigger = %trigger, error = %failure.message, "critical hook failed");
                critical.push(failure.message);
            } else {
                debug!(env_id = %env_id, trigger = %trigger, error = %failure.message, "non-critical hook failed");
            }
        }

        match critical.len() {
            0 => Ok(()),
            1 => Err(Error::Hook(format!(
                "critical hook failed at trigger {}: {}",
                trigger, critical[0]
            ))),
            n @ 2..=3 => Err(Error::Hook(format!(
                "{} critical hooks failed at trigger {}: {}",
                n,
                trigger,
                critical.join("; ")
            ))),
            n => Err(Error::Hook(format!(
                "{n} critical hooks failed at trigger {trigger}"
            ))),
        }
    }

    /// Start a call-hook and register it under its await point.
    fn start_call(&self, host: &dyn HookHost, hook: &Hook) {
        let HookKind::Call { func, return_var } = &hook.kind else {
            return;
        };
        let env_id = host.env_id();
        let timeout = hook.traits.timeout_or(self.default_timeout);
        let await_point = hook.traits.await_trigger();

        let mut vars = host.vars_for(&hook.role_path);
        vars.insert("environment_id".into(), env_id.to_string());
        vars.insert("__call_func".into(), func.clone());
        vars.insert(
            "__call_timeout".into(),
            hook.traits
                .timeout
                .clone()
                .unwrap_or_else(|| format!("{}s", timeout.as_secs())),
        );
        vars.insert("__call_trigger".into(), hook.traits.trigger.clone());
        vars.insert(
            "__call_await".into(),
            hook.traits
                .await_expr
                .clone()
                .unwrap_or_else(|| hook.traits.trigger.clone()),
        );
        vars.insert("__call_critical".into(), hook.traits.critical.to_string());
        vars.insert("__call_rolepath".into(), hook.role_path.clone());

        let request = CallRequest {
            env_id,
            func: func.clone(),
            role_path: hook.role_path.clone(),
            vars,
            timeout,
            cancel: CancellationToken::new(),
        };
        let call = PendingCall::start(
            self.calls.clone(),
            request,
            hook.traits.critical,
            return_var.clone(),
        );
        self.lock_pending()
            .entry(await_point.name)
            .or_default()
            .entry(await_point.weight)
            .or_default()
            .push(call);
    }

    async fn await_calls(&self, host: &dyn HookHost, due: Vec<PendingCall>) -> Vec<Failure> {
        let results = join_all(due.into_iter().map(|call| async move {
            let role_path = call.role_path().to_string();
            let critical = call.is_critical();
            let return_var = call.return_var().map(str::to_string);
            (role_path, critical, return_var, call.wait().await)
        }))
        .await;

        let mut failures = Vec::new();
        for (role_path, critical, return_var, result) in results {
            match result {
                Ok(output) => {
                    if let Some(var) = return_var {
                        host.set_runtime_var(&role_path, &var, output);
                    }
                }
                Err(e) => failures.push(Failure {
                    critical,
                    message: format!("{role_path}: {e}"),
                }),
            }
        }
        failures
    }
}
