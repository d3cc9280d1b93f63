// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Role status and task state algebra.
//!
//! Aggregator roles do not store a status or a state of their own; both are
//! folded from their children with the products defined here.

use serde::{Deserialize, Serialize};

/// Deployment status of a role or task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// Unknown; absorbs every other status.
    Undefined,
    /// Not deployed.
    #[default]
    Inactive,
    /// Some children deployed, some not.
    Partial,
    /// Deployed.
    Active,
    /// No resources could be found for the task.
    Undeployable,
    /// Neutral element, produced when folding only non-critical roles.
    Invariant,
}

impl Status {
    /// Returns the string representation of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Undefined => "UNDEFINED",
            Self::Inactive => "INACTIVE",
            Self::Partial => "PARTIAL",
            Self::Active => "ACTIVE",
            Self::Undeployable => "UNDEPLOYABLE",
            Self::Invariant => "INVARIANT",
        }
    }

    /// Status product.
    pub fn x(self, other: Status) -> Status {
        use Status::*;
        match (self, other) {
            (Undefined, _) | (_, Undefined) => Undefined,
            (Invariant, other) => other,
            (this, Invariant) => this,
            (Undeployable, _) | (_, Undeployable) => Undeployable,
            (Active, Active) => Active,
            (Inactive, Inactive) => Inactive,
            _ => Partial,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a task, or the aggregate state of a role subtree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// No task or no information.
    #[default]
    Unknown,
    /// Launched, not configured.
    Standby,
    /// Configured.
    Configured,
    /// Running.
    Running,
    /// Failed.
    Error,
    /// Finished.
    Done,
    /// Children disagree.
    Mixed,
    /// Neutral element; used by roles that never hold a task state.
    Invariant,
}

impl TaskState {
    /// Returns the string representation of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Standby => "STANDBY",
            Self::Configured => "CONFIGURED",
            Self::Running => "RUNNING",
            Self::Error => "ERROR",
            Self::Done => "DONE",
            Self::Mixed => "MIXED",
            Self::Invariant => "INVARIANT",
        }
    }

    /// Parse a state name. Unrecognised names map to `Unknown`.
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "STANDBY" => Self::Standby,
            "CONFIGURED" => Self::Configured,
            "RUNNING" => Self::Running,
            "ERROR" => Self::Error,
            "DONE" => Self::Done,
            "MIXED" => Self::Mixed,
            "INVARIANT" => Self::Invariant,
            _ => Self::Unknown,
        }
    }

    /// State product: ERROR dominates, equal states are kept, INVARIANT is
    /// neutral and anything else is MIXED.
    pub fn x(self, other: TaskState) -> TaskState {
        if self == other {
            return self;
        }
        if self == Self::Error || other == Self::Error {
            return Self::Error;
        }
        if self == Self::Invariant {
            return other;
        }
        if other == Self::Invariant {
            return self;
        }
        Self::Mixed
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fold child statuses. Non-critical children are skipped; an empty input
/// is `Undefined`.
pub fn aggregate_status<I>(children: I) -> Status
where
    I: IntoIterator<Item = (Status, bool)>,
{
    let mut children = children.into_iter().peekable();
    if children.peek().is_none() {
        return Status::Undefined;
    }

    let mut status = Status::Invariant;
    for (child, critical) in children {
        if status == Status::Undefined {
            break;
        }
        if !critical {
            continue;
        }
        status = status.x(child);
    }
    status
}

/// Fold child states. An empty input is `Invariant`; the fold stops early on
/// `Mixed` or `Error`.
pub fn aggregate_state<I>(children: I) -> TaskState
where
    I: IntoIterator<Item = TaskState>,
{
    let mut children = children.into_iter();
    let Some(mut state) = children.next() else {
        return TaskState::Invariant;
    };
    for child in children {
        if matches!(state, TaskState::Mixed | TaskState::Error) {
            break;
        }
        state = state.x(child);
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_product_table() {
        use Status::*;

        assert_eq!(Inactive.x(Active), Partial);
        assert_eq!(Active.x(Active), Active);
        assert_eq!(Inactive.x(Inactive), Inactive);
        assert_eq!(Partial.x(Inactive), Partial);
        assert_eq!(Active.x(Undeployable), Undeployable);
        assert_eq!(Undeployable.x(Undefined), Undefined);
        assert_eq!(Invariant.x(Partial), Partial);
        assert_eq!(Active.x(Invariant), Active);
        assert_eq!(Invariant.x(Invariant), Invariant);
    }

    #[test]
    fn test_state_product() {
        use TaskState::*;

        assert_eq!(Running.x(Running), Running);
        assert_eq!(Running.x(Configured), Mixed);
        assert_eq!(Configured.x(Error), Error);
        assert_eq!(Invariant.x(Standby), Standby);
        assert_eq!(Standby.x(Invariant), Standby);
    }

    #[test]
    fn test_aggregate_status_skips_non_critical() {
        let status = aggregate_status([
            (Status::Active, true),
            (Status::Inactive, false),
            (Status::Active, true),
        ]);
        assert_eq!(status, Status::Active);

        let only_optional = aggregate_status([(Status::Inactive, false)]);
        assert_eq!(only_optional, Status::Invariant);

        assert_eq!(aggregate_status(Vec::new()), Status::Undefined);
    }

    #[test]
    fn test_aggregate_state_short_circuits() {
        use TaskState::*;

        assert_eq!(aggregate_state([Configured, Configured]), Configured);
        assert_eq!(aggregate_state([Configured, Invariant]), Configured);
        assert_eq!(aggregate_state([Configured, Running, Error]), Mixed);
        assert_eq!(aggregate_state([Error, Running]), Error);
        assert_eq!(aggregate_state(Vec::new()), Invariant);
    }
}
