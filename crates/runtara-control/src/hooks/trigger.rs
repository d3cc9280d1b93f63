// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Trigger expressions and hook traits.
//!
//! A trigger expression names a lifecycle moment and an optional weight
//! offset: `before_CONFIGURE`, `leave_RUNNING-10`, `after_START_ACTIVITY+50`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::parse_duration;

/// A parsed trigger expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Trigger {
    /// Trigger name, e.g. `before_CONFIGURE`.
    pub name: String,
    /// Ordering weight within the trigger.
    pub weight: i32,
}

impl Trigger {
    /// Parse `<name>[+|-<weight>]`. The expression is split at the last
    /// `+` or `-`; when the suffix is not an integer the whole expression is
    /// the name and the weight is 0.
    pub fn parse(expr: &str) -> Trigger {
        let expr = expr.trim();
        if let Some(idx) = expr.rfind(['+', '-']) {
            let (name, weight) = expr.split_at(idx);
            let magnitude = weight[1..].trim();
            if !name.is_empty()
                && !magnitude.is_empty()
                && let Ok(value) = magnitude.parse::<i32>()
            {
                let weight = if weight.starts_with('-') { -value } else { value };
                return Trigger {
                    name: name.trim().to_string(),
                    weight,
                };
            }
        }
        Trigger {
            name: expr.to_string(),
            weight: 0,
        }
    }
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.weight {
            0 => f.write_str(&self.name),
            w if w > 0 => write!(f, "{}+{}", self.name, w),
            w => write!(f, "{}{}", self.name, w),
        }
    }
}

fn default_critical() -> bool {
    true
}

/// When and how a hook runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookTraits {
    /// Trigger expression at which the hook starts.
    pub trigger: String,
    /// Trigger expression at which the hook is awaited. Defaults to `trigger`.
    #[serde(default, rename = "await")]
    pub await_expr: Option<String>,
    /// Timeout expression such as `30s`.
    #[serde(default)]
    pub timeout: Option<String>,
    /// Whether a failure must abort the transition.
    #[serde(default = "default_critical")]
    pub critical: bool,
}

impl HookTraits {
    /// Critical hook started and awaited at `trigger`.
    pub fn new(trigger: impl Into<String>) -> Self {
        Self {
            trigger: trigger.into(),
            await_expr: None,
            timeout: None,
            critical: true,
        }
    }

    /// Await the hook at a different trigger.
    pub fn awaiting(mut self, await_expr: impl Into<String>) -> Self {
        self.await_expr = Some(await_expr.into());
        self
    }

    /// Set the timeout expression.
    pub fn with_timeout(mut self, timeout: impl Into<String>) -> Self {
        self.timeout = Some(timeout.into());
        self
    }

    /// Mark the hook non-critical.
    pub fn non_critical(mut self) -> Self {
        self.critical = false;
        self
    }

    /// Parsed trigger.
    pub fn trigger(&self) -> Trigger {
        Trigger::parse(&self.trigger)
    }

    /// Parsed await point.
    pub fn await_trigger(&self) -> Trigger {
        Trigger::parse(self.await_expr.as_deref().unwrap_or(&self.trigger))
    }

    /// Timeout, falling back to `default` when absent or unparsable.
    pub fn timeout_or(&self, default: Duration) -> Duration {
        self.timeout
            .as_deref()
            .and_then(parse_duration)
            .unwrap_or(default)
    }
}
