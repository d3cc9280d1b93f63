// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Environment lifecycle states and the transition table.
//!
//! ```text
//!                 DEPLOY            CONFIGURE         START_ACTIVITY
//!   ┌─────────┐ ────────► ┌──────────┐ ────────► ┌────────────┐ ────────► ┌─────────┐
//!   │ STANDBY │           │ DEPLOYED │           │ CONFIGURED │           │ RUNNING │
//!   └─────────┘ ◄──────── └──────────┘           └────────────┘ ◄──────── └─────────┘
//!     │    ▲      RESET (from CONFIGURED/ERROR)     │   ▲ CONFIGURE   STOP_ACTIVITY
//!     │    └────────────────────────────────────────┘   └──┘
//!     │ EXIT (from STANDBY/CONFIGURED)
//!     ▼
//!   ┌──────┐        GO_ERROR (from DEPLOYED/CONFIGURED/RUNNING)   ┌───────┐
//!   │ DONE │                                                      │ ERROR │
//!   └──────┘                                                      └───────┘
//! ```

use serde::{Deserialize, Serialize};

/// Lifecycle state of an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvState {
    /// Created, nothing deployed yet.
    Standby,
    /// Tasks acquired and placed on hosts.
    Deployed,
    /// Tasks configured and ready to run.
    Configured,
    /// An activity (run) is in progress.
    Running,
    /// A failure occurred; needs RESET or teardown.
    Error,
    /// Terminal state.
    Done,
}

impl EnvState {
    /// All states, in lifecycle order.
    pub const ALL: [EnvState; 6] = [
        EnvState::Standby,
        EnvState::Deployed,
        EnvState::Configured,
        EnvState::Running,
        EnvState::Error,
        EnvState::Done,
    ];

    /// Returns the string representation of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standby => "STANDBY",
            Self::Deployed => "DEPLOYED",
            Self::Configured => "CONFIGURED",
            Self::Running => "RUNNING",
            Self::Error => "ERROR",
            Self::Done => "DONE",
        }
    }

    /// Destination state of `event` from this state, or `None` if the
    /// transition is not permitted.
    pub fn next(self, event: Event) -> Option<EnvState> {
        event.sources().contains(&self).then(|| event.destination())
    }

    /// Whether no further transition can leave this state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done)
    }
}

impl std::fmt::Display for EnvState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EnvState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        EnvState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("Unknown environment state: {}", s))
    }
}

/// A lifecycle event (transition name).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Event {
    /// Acquire and place tasks.
    Deploy,
    /// Push configuration to tasks.
    Configure,
    /// Start a run.
    StartActivity,
    /// Stop the current run.
    StopActivity,
    /// Return to STANDBY.
    Reset,
    /// Enter ERROR.
    GoError,
    /// Finish the environment.
    Exit,
}

impl Event {
    /// All events.
    pub const ALL: [Event; 7] = [
        Event::Deploy,
        Event::Configure,
        Event::StartActivity,
        Event::StopActivity,
        Event::Reset,
        Event::GoError,
        Event::Exit,
    ];

    /// Returns the string representation of the event.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deploy => "DEPLOY",
            Self::Configure => "CONFIGURE",
            Self::StartActivity => "START_ACTIVITY",
            Self::StopActivity => "STOP_ACTIVITY",
            Self::Reset => "RESET",
            Self::GoError => "GO_ERROR",
            Self::Exit => "EXIT",
        }
    }

    /// States from which this event may be issued.
    pub fn sources(self) -> &'static [EnvState] {
        use EnvState::*;
        match self {
            Self::Deploy => &[Standby],
            Self::Configure => &[Deployed, Configured],
            Self::StartActivity => &[Configured],
            Self::StopActivity => &[Running],
            Self::Reset => &[Configured, Error],
            Self::GoError => &[Deployed, Configured, Running],
            Self::Exit => &[Standby, Configured],
        }
    }

    /// State reached once this event commits.
    pub fn destination(self) -> EnvState {
        match self {
            Self::Deploy => EnvState::Deployed,
            Self::Configure => EnvState::Configured,
            Self::StartActivity => EnvState::Running,
            Self::StopActivity => EnvState::Configured,
            Self::Reset => EnvState::Standby,
            Self::GoError => EnvState::Error,
            Self::Exit => EnvState::Done,
        }
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Event {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Event::ALL
            .into_iter()
            .find(|event| event.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("Unknown event: {}", s))
    }
}
