// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for runtara-control.

use thiserror::Error;

use crate::ids::EnvironmentId;
use crate::state::{EnvState, Event};
use crate::workflow::{RoleError, WorkflowError};

/// Control plane errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Workflow template could not be loaded.
    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    /// Role tree operation failed.
    #[error("Role error: {0}")]
    Role(#[from] RoleError),

    /// The event is not allowed from the current state.
    #[error("transition {event} not allowed from state {state}")]
    InvalidTransition {
        /// Requested event.
        event: Event,
        /// State the environment was in.
        state: EnvState,
    },

    /// Another transition holds the environment.
    #[error("cannot run {event}: another transition is in progress")]
    TransitionInProgress {
        /// Requested event.
        event: Event,
    },

    /// No environment with this id.
    #[error("Environment not found: {0}")]
    EnvironmentNotFound(EnvironmentId),

    /// Request validation failed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Exclusive resource classes are already claimed by another environment.
    #[error("resource classes already in use: {}", .classes.join(", "))]
    ResourceConflict {
        /// Overlapping classes, sorted.
        classes: Vec<String>,
    },

    /// Waiting on the task coordinator exceeded its bound.
    #[error("{0}")]
    Timeout(String),

    /// The task coordinator reported a failure or went away.
    #[error("{0}")]
    Coordination(String),

    /// One or more critical hooks failed.
    #[error("{0}")]
    Hook(String),

    /// An operation on a specific environment failed.
    #[error("environment {env_id} {operation} failed in state {state}: {source}")]
    Environment {
        /// Environment.
        env_id: EnvironmentId,
        /// Operation that failed, e.g. `CONFIGURE` or `teardown`.
        operation: String,
        /// State after the failure.
        state: EnvState,
        /// Underlying failure.
        source: Box<Error>,
    },

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Wrap the error with environment context. Already wrapped errors are
    /// returned unchanged.
    pub fn in_environment(
        self,
        env_id: EnvironmentId,
        operation: impl Into<String>,
        state: EnvState,
    ) -> Error {
        match self {
            Error::Environment { .. } => self,
            other => Error::Environment {
                env_id,
                operation: operation.into(),
                state,
                source: Box::new(other),
            },
        }
    }

    /// The innermost error, looking through environment context.
    pub fn root(&self) -> &Error {
        match self {
            Error::Environment { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Result type using the control plane Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_context_wraps_once() {
        let env_id = EnvironmentId::new();
        let err = Error::Timeout("timed out".into())
            .in_environment(env_id, "CONFIGURE", EnvState::Deployed)
            .in_environment(env_id, "teardown", EnvState::Error);

        match &err {
            Error::Environment { operation, state, .. } => {
                assert_eq!(operation, "CONFIGURE");
                assert_eq!(*state, EnvState::Deployed);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(matches!(err.root(), Error::Timeout(_)));
        assert!(err.to_string().ends_with("timed out"));
    }

    #[test]
    fn test_conflict_message_lists_classes() {
        let err = Error::ResourceConflict {
            classes: vec!["ITS".into(), "TPC".into()],
        };
        assert_eq!(err.to_string(), "resource classes already in use: ITS, TPC");
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = Error::InvalidTransition {
            event: Event::StartActivity,
            state: EnvState::Standby,
        };
        assert_eq!(
            err.to_string(),
            "transition START_ACTIVITY not allowed from state STANDBY"
        );
    }
}
