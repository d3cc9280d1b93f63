// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Role tree nodes.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::class::TaskClass;
use super::status::{Status, TaskState, aggregate_state, aggregate_status};
use crate::hooks::{Hook, HookKind, HookTraits};
use crate::ids::{EnvironmentId, TaskId};
use crate::offers::{Constraints, TaskDescriptor};

/// Separator between role names in a role path.
pub const PATH_SEPARATOR: char = '.';

/// Role tree errors.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum RoleError {
    /// No role at the given path.
    #[error("role not found: {0}")]
    NotFound(String),
    /// The role exists but is not a task-role.
    #[error("role {0} is not a task role")]
    NotATask(String),
    /// The task-role is already bound to another task.
    #[error("role {path} is already bound to task {task_id}")]
    AlreadyBound {
        /// Role path.
        path: String,
        /// Task currently bound.
        task_id: TaskId,
    },
}

/// A task bound to a task-role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundTask {
    /// Task identifier.
    pub task_id: TaskId,
    /// Host the task was placed on.
    pub hostname: String,
}

/// Snapshot of a bound task, with the facts transitions and policies need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    /// Task identifier.
    pub task_id: TaskId,
    /// Path of the owning task-role.
    pub role_path: String,
    /// Name of the owning task-role.
    pub role_name: String,
    /// Host.
    pub hostname: String,
    /// Whether the role is critical.
    pub critical: bool,
    /// Last known task state.
    pub state: TaskState,
    /// Role status.
    pub status: Status,
    /// Trigger name if the task is a task-hook.
    pub hook_trigger: Option<String>,
}

impl TaskInfo {
    /// Whether the task is a task-hook.
    pub fn is_hook(&self) -> bool {
        self.hook_trigger.is_some()
    }
}

fn default_true() -> bool {
    true
}

/// A role backed by one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRole {
    /// Task class.
    pub class: TaskClass,
    /// Whether a failure of this task affects the environment.
    #[serde(default = "default_true")]
    pub critical: bool,
    /// Detector (exclusive resource class) this task belongs to.
    #[serde(default)]
    pub detector: Option<String>,
    /// Set when the task is a task-hook rather than a long-running task.
    #[serde(default)]
    pub hook: Option<HookTraits>,
    #[serde(skip)]
    task: Option<BoundTask>,
    #[serde(skip)]
    status: Status,
    #[serde(skip)]
    state: TaskState,
}

impl TaskRole {
    /// A critical task-role.
    pub fn new(class: TaskClass) -> Self {
        Self {
            class,
            critical: true,
            detector: None,
            hook: None,
            task: None,
            status: Status::default(),
            state: TaskState::default(),
        }
    }

    /// Mark the role non-critical.
    pub fn non_critical(mut self) -> Self {
        self.critical = false;
        self
    }

    /// Assign a detector.
    pub fn with_detector(mut self, detector: impl Into<String>) -> Self {
        self.detector = Some(detector.into());
        self
    }

    /// Make the role a task-hook.
    pub fn as_hook(mut self, traits: HookTraits) -> Self {
        self.hook = Some(traits);
        self
    }

    /// Bound task.
    pub fn task(&self) -> Option<&BoundTask> {
        self.task.as_ref()
    }
}

/// A role backed by an inline call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRole {
    /// Function to call.
    pub func: String,
    /// Runtime variable the call output is stored in.
    #[serde(default, rename = "return")]
    pub return_var: Option<String>,
    /// Trigger, await point, timeout and criticality.
    #[serde(flatten)]
    pub traits: HookTraits,
    #[serde(skip)]
    status: Status,
}

impl CallRole {
    /// A call-role running `func` with the given traits.
    pub fn new(func: impl Into<String>, traits: HookTraits) -> Self {
        Self {
            func: func.into(),
            return_var: None,
            traits,
            status: Status::default(),
        }
    }
}

/// Node variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleKind {
    /// Inner node.
    #[serde(rename = "roles")]
    Aggregator(Vec<Role>),
    /// Task-backed leaf.
    Task(TaskRole),
    /// Call-backed leaf.
    Call(CallRole),
}

/// A node of the role tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    /// Role name, unique among siblings.
    pub name: String,
    /// Variables visible to this role and its descendants.
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
    /// Placement constraints.
    #[serde(default)]
    pub constraints: Constraints,
    /// Variant.
    #[serde(flatten)]
    pub kind: RoleKind,
    #[serde(skip)]
    path: String,
    #[serde(skip)]
    runtime_vars: BTreeMap<String, String>,
}

impl Role {
    /// Build a node. Call [`finalize`](Self::finalize) on the root once the tree is complete.
    pub fn new(name: impl Into<String>, kind: RoleKind) -> Self {
        let name = name.into();
        Self {
            path: name.clone(),
            name,
            vars: BTreeMap::new(),
            constraints: Constraints::default(),
            kind,
            runtime_vars: BTreeMap::new(),
        }
    }

    /// An aggregator.
    pub fn aggregator(name: impl Into<String>, children: Vec<Role>) -> Self {
        Self::new(name, RoleKind::Aggregator(children))
    }

    /// A task-role.
    pub fn task(name: impl Into<String>, task: TaskRole) -> Self {
        Self::new(name, RoleKind::Task(task))
    }

    /// A call-role.
    pub fn call(name: impl Into<String>, call: CallRole) -> Self {
        Self::new(name, RoleKind::Call(call))
    }

    /// Set a variable.
    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    /// Set the constraints.
    pub fn with_constraints(mut self, constraints: Constraints) -> Self {
        self.constraints = constraints;
        self
    }

    /// Assign paths and propagate inherited constraints through the tree.
    pub fn finalize(mut self) -> Self {
        let name = self.name.clone();
        self.assign(name, &Constraints::default());
        self
    }

    fn assign(&mut self, path: String, parent_constraints: &Constraints) {
        self.path = path;
        self.constraints = self.constraints.merge_parent(parent_constraints);
        if let RoleKind::Aggregator(children) = &mut self.kind {
            for child in children {
                let child_path = format!("{}{}{}", self.path, PATH_SEPARATOR, child.name);
                child.assign(child_path, &self.constraints);
            }
        }
    }

    /// Role name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dot-separated path from the root.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Child roles; empty for leaves.
    pub fn children(&self) -> &[Role] {
        match &self.kind {
            RoleKind::Aggregator(children) => children,
            _ => &[],
        }
    }

    /// Aggregators count as critical.
    pub fn is_critical(&self) -> bool {
        match &self.kind {
            RoleKind::Aggregator(_) => true,
            RoleKind::Task(t) => t.critical,
            RoleKind::Call(c) => c.traits.critical,
        }
    }

    /// Deployment status; folded from the children for aggregators.
    pub fn status(&self) -> Status {
        match &self.kind {
            RoleKind::Aggregator(children) => {
                aggregate_status(children.iter().map(|r| (r.status(), r.is_critical())))
            }
            RoleKind::Task(t) => t.status,
            RoleKind::Call(c) => c.status,
        }
    }

    /// Set the status; aggregators forward it to every descendant.
    pub fn set_status(&mut self, status: Status) {
        match &mut self.kind {
            RoleKind::Aggregator(children) => {
                for child in children {
                    child.set_status(status);
                }
            }
            RoleKind::Task(t) => t.status = status,
            RoleKind::Call(c) => c.status = status,
        }
    }

    /// Task state; folded from the children for aggregators. Calls and
    /// task-hooks are neutral.
    pub fn state(&self) -> TaskState {
        match &self.kind {
            RoleKind::Aggregator(children) => aggregate_state(children.iter().map(Role::state)),
            RoleKind::Task(t) if t.hook.is_some() => TaskState::Invariant,
            RoleKind::Task(t) => t.state,
            RoleKind::Call(_) => TaskState::Invariant,
        }
    }

    /// Pre-order traversal.
    pub fn walk(&self) -> Vec<&Role> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(role) = stack.pop() {
            out.push(role);
            stack.extend(role.children().iter().rev());
        }
        out
    }

    fn for_each_mut(&mut self, f: &mut impl FnMut(&mut Role)) {
        f(self);
        if let RoleKind::Aggregator(children) = &mut self.kind {
            for child in children {
                child.for_each_mut(f);
            }
        }
    }

    /// Role at `path`.
    pub fn find(&self, path: &str) -> Option<&Role> {
        self.walk().into_iter().find(|r| r.path == path)
    }

    /// Mutable role at `path`.
    pub fn find_mut(&mut self, path: &str) -> Option<&mut Role> {
        if self.path == path {
            return Some(self);
        }
        let prefix = format!("{}{}", self.path, PATH_SEPARATOR);
        if !path.starts_with(&prefix) {
            return None;
        }
        match &mut self.kind {
            RoleKind::Aggregator(children) => children.iter_mut().find_map(|c| c.find_mut(path)),
            _ => None,
        }
    }

    fn find_task_mut(&mut self, task_id: &TaskId) -> Option<&mut Role> {
        let bound_here = matches!(
            &self.kind,
            RoleKind::Task(t) if t.task.as_ref().is_some_and(|b| &b.task_id == task_id)
        );
        if bound_here {
            return Some(self);
        }
        match &mut self.kind {
            RoleKind::Aggregator(children) => {
                children.iter_mut().find_map(|c| c.find_task_mut(task_id))
            }
            _ => None,
        }
    }

    /// Role bound to `task_id`.
    pub fn find_task(&self, task_id: &TaskId) -> Option<&Role> {
        self.walk().into_iter().find(|r| match &r.kind {
            RoleKind::Task(t) => t.task.as_ref().is_some_and(|b| &b.task_id == task_id),
            _ => false,
        })
    }

    /// Runtime variable of this role.
    pub fn runtime_var(&self, key: &str) -> Option<&str> {
        self.runtime_vars.get(key).map(String::as_str)
    }

    /// Set runtime variables on this role.
    pub fn set_runtime_vars<K, V>(&mut self, vars: impl IntoIterator<Item = (K, V)>)
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.runtime_vars
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
    }

    /// Variables as seen by the role at `path`: `base` overlaid with the vars
    /// and runtime vars of every role from the root down to `path`.
    pub fn vars_for(&self, path: &str, base: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut out = base.clone();
        self.collect_vars(path, &mut out);
        out
    }

    fn collect_vars(&self, path: &str, out: &mut BTreeMap<String, String>) {
        let on_path = self.path == path
            || path
                .strip_prefix(self.path.as_str())
                .is_some_and(|rest| rest.starts_with(PATH_SEPARATOR));
        if !on_path {
            return;
        }
        out.extend(self.vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        out.extend(self.runtime_vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        for child in self.children() {
            child.collect_vars(path, out);
        }
    }

    /// Bound tasks, including task-hooks.
    pub fn tasks(&self) -> Vec<TaskInfo> {
        self.walk()
            .into_iter()
            .filter_map(|role| match &role.kind {
                RoleKind::Task(t) => t.task.as_ref().map(|bound| TaskInfo {
                    task_id: bound.task_id.clone(),
                    role_path: role.path.clone(),
                    role_name: role.name.clone(),
                    hostname: bound.hostname.clone(),
                    critical: t.critical,
                    state: t.state,
                    status: t.status,
                    hook_trigger: t.hook.as_ref().map(|h| h.trigger().name),
                }),
                _ => None,
            })
            .collect()
    }

    /// Bind a task to the task-role at `path`.
    pub fn bind_task(&mut self, path: &str, task: BoundTask) -> Result<(), RoleError> {
        let role = self
            .find_mut(path)
            .ok_or_else(|| RoleError::NotFound(path.to_string()))?;
        let RoleKind::Task(t) = &mut role.kind else {
            return Err(RoleError::NotATask(path.to_string()));
        };
        match &t.task {
            Some(bound) if bound.task_id != task.task_id => Err(RoleError::AlreadyBound {
                path: path.to_string(),
                task_id: bound.task_id.clone(),
            }),
            _ => {
                t.task = Some(task);
                t.state = TaskState::Standby;
                Ok(())
            }
        }
    }

    /// Detach `task_id` from its role. Returns whether a role was bound to it.
    pub fn unbind_task(&mut self, task_id: &TaskId) -> bool {
        match self.find_task_mut(task_id) {
            Some(role) => {
                if let RoleKind::Task(t) = &mut role.kind {
                    t.task = None;
                    t.status = Status::Inactive;
                    t.state = TaskState::Unknown;
                }
                true
            }
            None => false,
        }
    }

    /// Set the status of the task-role at `path`.
    pub fn set_role_status(&mut self, path: &str, status: Status) -> Result<(), RoleError> {
        let role = self
            .find_mut(path)
            .ok_or_else(|| RoleError::NotFound(path.to_string()))?;
        role.set_status(status);
        Ok(())
    }

    /// Record a new state for `task_id`. Returns whether the task is known.
    pub fn set_task_state(&mut self, task_id: &TaskId, state: TaskState) -> bool {
        match self.find_task_mut(task_id) {
            Some(Role {
                kind: RoleKind::Task(t),
                ..
            }) => {
                t.state = state;
                true
            }
            _ => false,
        }
    }

    /// Set the status of every call-role.
    pub fn set_call_status(&mut self, status: Status) {
        self.for_each_mut(&mut |role| {
            if let RoleKind::Call(c) = &mut role.kind {
                c.status = status;
            }
        });
    }

    /// Descriptors for every task-role that has no task yet.
    pub fn descriptors(&self, env_id: EnvironmentId) -> Vec<TaskDescriptor> {
        self.walk()
            .into_iter()
            .filter_map(|role| match &role.kind {
                RoleKind::Task(t) if t.task.is_none() => Some(TaskDescriptor {
                    env_id,
                    role_path: role.path.clone(),
                    class: t.class.clone(),
                    constraints: role.constraints.clone(),
                    critical: t.critical,
                    detector: t.detector.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    /// Exclusive resource classes (detectors) claimed by the tree.
    pub fn resource_classes(&self) -> BTreeSet<String> {
        self.walk()
            .into_iter()
            .filter_map(|role| match &role.kind {
                RoleKind::Task(t) => t.detector.clone(),
                _ => None,
            })
            .collect()
    }

    /// Hooks whose trigger name is `trigger`, grouped by weight. Within a
    /// weight, hooks keep tree pre-order.
    pub fn hooks_for_trigger(&self, trigger: &str) -> BTreeMap<i32, Vec<Hook>> {
        let mut hooks: BTreeMap<i32, Vec<Hook>> = BTreeMap::new();
        for role in self.walk() {
            let (traits, kind) = match &role.kind {
                RoleKind::Call(c) => (
                    &c.traits,
                    HookKind::Call {
                        func: c.func.clone(),
                        return_var: c.return_var.clone(),
                    },
                ),
                RoleKind::Task(t) => match &t.hook {
                    Some(traits) => (
                        traits,
                        HookKind::Task {
                            task: t.task.clone(),
                            active: t.status == Status::Active,
                        },
                    ),
                    None => continue,
                },
                RoleKind::Aggregator(_) => continue,
            };
            let parsed = traits.trigger();
            if parsed.name != trigger {
                continue;
            }
            hooks.entry(parsed.weight).or_default().push(Hook {
                role_path: role.path.clone(),
                role_name: role.name.clone(),
                traits: traits.clone(),
                kind,
            });
        }
        hooks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offers::Constraint;

    fn class() -> TaskClass {
        TaskClass::new("readout", "/usr/bin/readout").with_wants(1.0, 512.0)
    }

    fn tree() -> Role {
        Role::aggregator(
            "root",
            vec![
                Role::task("readout", TaskRole::new(class()).with_detector("TPC"))
                    .with_var("card", "1"),
                Role::aggregator(
                    "qc",
                    vec![
                        Role::task("checker", TaskRole::new(class()).non_critical()),
                        Role::call(
                            "notify",
                            CallRole::new("bookkeeping.Notify", HookTraits::new("after_CONFIGURE")),
                        ),
                    ],
                )
                .with_constraints(Constraints::new(vec![Constraint::equals("rack", "7")])),
            ],
        )
        .with_var("run_type", "PHYSICS")
        .finalize()
    }

    #[test]
    fn test_finalize_assigns_paths_and_inherits_constraints() {
        let root = tree();
        assert!(root.find("root.qc.checker").is_some());
        assert_eq!(root.find("root.readout").unwrap().path(), "root.readout");
        let checker = root.find("root.qc.checker").unwrap();
        assert_eq!(checker.constraints.get("rack").unwrap().value, "7");
        assert!(root.find("root.readout").unwrap().constraints.is_empty());
    }

    #[test]
    fn test_vars_are_resolved_down_the_path() {
        let root = tree();
        let base = BTreeMap::from([("environment_id".to_string(), "e".to_string())]);
        let vars = root.vars_for("root.readout", &base);
        assert_eq!(vars.get("card").map(String::as_str), Some("1"));
        assert_eq!(vars.get("run_type").map(String::as_str), Some("PHYSICS"));
        assert_eq!(vars.get("environment_id").map(String::as_str), Some("e"));

        let qc_vars = root.vars_for("root.qc.checker", &base);
        assert!(!qc_vars.contains_key("card"));
    }

    #[test]
    fn test_status_aggregation_ignores_non_critical_roles() {
        let mut root = tree();
        assert_eq!(root.status(), Status::Inactive);

        root.set_role_status("root.readout", Status::Active).unwrap();
        root.set_call_status(Status::Active);
        // the non-critical checker is still INACTIVE
        assert_eq!(root.status(), Status::Active);

        root.set_role_status("root.readout", Status::Undeployable)
            .unwrap();
        assert_eq!(root.status(), Status::Undeployable);
    }

    #[test]
    fn test_bind_and_rebind() {
        let mut root = tree();
        let first = BoundTask {
            task_id: TaskId::from("t1"),
            hostname: "flp001".into(),
        };
        root.bind_task("root.readout", first.clone()).unwrap();
        // binding the same task again is a no-op
        root.bind_task("root.readout", first).unwrap();

        let err = root
            .bind_task(
                "root.readout",
                BoundTask {
                    task_id: TaskId::from("t2"),
                    hostname: "flp002".into(),
                },
            )
            .unwrap_err();
        assert!(matches!(err, RoleError::AlreadyBound { .. }));

        assert!(root.unbind_task(&TaskId::from("t1")));
        assert!(root.find("root.readout").unwrap().status() == Status::Inactive);
        assert!(!root.unbind_task(&TaskId::from("t1")));
        assert_eq!(
            root.bind_task("root.qc", BoundTask {
                task_id: TaskId::from("t3"),
                hostname: "h".into()
            }),
            Err(RoleError::NotATask("root.qc".into()))
        );
    }

    #[test]
    fn test_state_folding() {
        let mut root = tree();
        for (path, id) in [("root.readout", "t1"), ("root.qc.checker", "t2")] {
            root.bind_task(path, BoundTask {
                task_id: TaskId::from(id),
                hostname: "flp001".into(),
            })
            .unwrap();
        }
        assert_eq!(root.state(), TaskState::Standby);

        root.set_task_state(&TaskId::from("t1"), TaskState::Configured);
        assert_eq!(root.state(), TaskState::Mixed);

        root.set_task_state(&TaskId::from("t2"), TaskState::Configured);
        assert_eq!(root.state(), TaskState::Configured);

        assert_eq!(root.tasks().len(), 2);
        assert!(root.tasks().iter().any(|t| !t.critical));
    }

    #[test]
    fn test_descriptors_only_for_unbound_roles() {
        let mut root = tree();
        let env_id = EnvironmentId::new();
        assert_eq!(root.descriptors(env_id).len(), 2);

        root.bind_task("root.readout", BoundTask {
            task_id: TaskId::from("t1"),
            hostname: "flp001".into(),
        })
        .unwrap();
        let descriptors = root.descriptors(env_id);
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].role_path, "root.qc.checker");
        assert_eq!(descriptors[0].constraints.get("rack").unwrap().value, "7");
    }

    #[test]
    fn test_hooks_grouped_by_weight_in_tree_order() {
        let root = Role::aggregator(
            "root",
            vec![
                Role::call("c1", CallRole::new("f", HookTraits::new("before_CONFIGURE+10"))),
                Role::call("c2", CallRole::new("f", HookTraits::new("before_CONFIGURE"))),
                Role::call("c3", CallRole::new("f", HookTraits::new("before_CONFIGURE+10"))),
                Role::call("c4", CallRole::new("f", HookTraits::new("after_CONFIGURE"))),
            ],
        )
        .finalize();

        let hooks = root.hooks_for_trigger("before_CONFIGURE");
        assert_eq!(hooks.keys().copied().collect::<Vec<_>>(), vec![0, 10]);
        let at_ten: Vec<_> = hooks[&10].iter().map(|h| h.role_path.as_str()).collect();
        assert_eq!(at_ten, vec!["root.c1", "root.c3"]);
    }

    #[test]
    fn test_task_hook_activity_follows_its_own_role() {
        let mut root = Role::aggregator(
            "root",
            vec![
                Role::task("readout", TaskRole::new(class())),
                Role::task(
                    "cleanup",
                    TaskRole::new(class()).as_hook(HookTraits::new("DESTROY")),
                ),
            ],
        )
        .finalize();
        for (path, id) in [("root.readout", "t1"), ("root.cleanup", "t2")] {
            root.bind_task(path, BoundTask {
                task_id: TaskId::from(id),
                hostname: "flp001".into(),
            })
            .unwrap();
            root.set_role_status(path, Status::Active).unwrap();
        }
        // teardown releases readout first, which leaves root non-ACTIVE
        root.unbind_task(&TaskId::from("t1"));
        assert_ne!(root.status(), Status::Active);

        let hooks = root.hooks_for_trigger("DESTROY");
        assert!(matches!(hooks[&0][0].kind, HookKind::Task { active: true, .. }));

        root.set_role_status("root.cleanup", Status::Inactive).unwrap();
        let hooks = root.hooks_for_trigger("DESTROY");
        assert!(matches!(hooks[&0][0].kind, HookKind::Task { active: false, .. }));
    }

    #[test]
    fn test_resource_classes() {
        let root = tree();
        assert_eq!(
            root.resource_classes().into_iter().collect::<Vec<_>>(),
            vec!["TPC".to_string()]
        );
    }

    #[test]
    fn test_template_deserialization() {
        let json = r#"{
            "name": "root",
            "vars": {"run_type": "COSMICS"},
            "roles": [
                {"name": "readout", "task": {"class": {"name": "readout", "command": "readout.exe", "cpu": 1, "memory": 128, "ports": "9000-9001"}, "detector": "ITS"}},
                {"name": "notify", "call": {"func": "bk.Notify", "trigger": "after_START_ACTIVITY", "critical": false}}
            ]
        }"#;
        let root: Role = serde_json::from_str(json).unwrap();
        let root = root.finalize();
        assert_eq!(root.children().len(), 2);
        let readout = root.find("root.readout").unwrap();
        assert!(readout.is_critical());
        assert!(!root.find("root.notify").unwrap().is_critical());
        assert_eq!(root.resource_classes().len(), 1);
    }
}
