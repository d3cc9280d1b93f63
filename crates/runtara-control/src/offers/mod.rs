// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resource offers and the offer-to-launch matcher.
//!
//! The cluster resource manager sends batches of [`Offer`]s. The
//! [`OfferMatcher`] binds pending [`TaskDescriptor`]s to them first-fit and
//! the caller accepts the matched offers with their [`Launch`]es through a
//! [`ResourceManager`] and declines the rest.

mod constraint;
mod matcher;
pub mod mock;
mod ranges;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use constraint::{Attributes, Constraint, Constraints, MACHINE_ID_ATTRIBUTE, Operator};
pub use matcher::{MatchOutcome, MatcherConfig, OfferMatcher};
pub use mock::MockResourceManager;
pub use ranges::{PortRange, RangeParseError, Ranges};

use crate::ids::{EnvironmentId, TaskId};
use crate::workflow::{Limits, OutboundChannel, TaskClass};

/// A resource grant for one host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    /// Offer identifier.
    pub id: String,
    /// Host the resources live on.
    pub hostname: String,
    /// Host attributes.
    #[serde(default)]
    pub attributes: Attributes,
    /// CPUs offered.
    pub cpu: f64,
    /// Memory offered, in MB.
    pub memory: f64,
    /// Ports offered.
    #[serde(default)]
    pub ports: Ranges,
    /// Executors already running on the host for this framework.
    #[serde(default)]
    pub executor_ids: Vec<String>,
}

impl Offer {
    /// An offer with no attributes and no executors.
    pub fn new(
        id: impl Into<String>,
        hostname: impl Into<String>,
        cpu: f64,
        memory: f64,
        ports: Ranges,
    ) -> Self {
        Self {
            id: id.into(),
            hostname: hostname.into(),
            attributes: Attributes::default(),
            cpu,
            memory,
            ports,
            executor_ids: Vec::new(),
        }
    }

    /// Attach host attributes.
    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes = attributes;
        self
    }

    /// Resources still available in the full offer.
    pub fn resources(&self) -> Resources {
        Resources {
            cpu: self.cpu,
            memory: self.memory,
            ports: self.ports.clone(),
        }
    }
}

/// Scalar and range resources.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    /// CPUs.
    pub cpu: f64,
    /// Memory in MB.
    pub memory: f64,
    /// Ports.
    pub ports: Ranges,
}

/// A request to place one task-role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    /// Owning environment.
    pub env_id: EnvironmentId,
    /// Path of the task-role in the role tree.
    pub role_path: String,
    /// Launch template and wants.
    pub class: TaskClass,
    /// Placement constraints, already merged with the parents'.
    pub constraints: Constraints,
    /// Whether the task is critical.
    pub critical: bool,
    /// Detector (exclusive resource class) the task belongs to.
    pub detector: Option<String>,
}

/// A bound inbound channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelBinding {
    /// Channel name, or `::<alias>` for global aliases.
    pub name: String,
    /// Bind address.
    pub address: String,
}

/// Process command of a launch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchCommand {
    /// Executable.
    pub value: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Environment.
    pub env: BTreeMap<String, String>,
}

/// One task launch on an accepted offer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Launch {
    /// New task identifier.
    pub task_id: TaskId,
    /// Owning environment.
    pub env_id: EnvironmentId,
    /// Task-role path.
    pub role_path: String,
    /// Offer consumed.
    pub offer_id: String,
    /// Host.
    pub hostname: String,
    /// Executor that will run the task.
    pub executor_id: String,
    /// Command line.
    pub command: LaunchCommand,
    /// Resources consumed from the offer.
    pub resources: Resources,
    /// Resource limits.
    pub limits: Limits,
    /// Task labels.
    pub labels: BTreeMap<String, String>,
    /// Control port.
    pub control_port: u64,
    /// Bound inbound channels.
    pub bindings: Vec<ChannelBinding>,
    /// Outbound channels, passed through unresolved.
    pub connect: Vec<OutboundChannel>,
    /// Whether the task is critical.
    pub critical: bool,
}

/// Errors from the cluster resource manager.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ResourceManagerError {
    /// The offer is no longer valid.
    #[error("offer {0} rescinded")]
    Rescinded(String),
    /// The resource manager could not be reached.
    #[error("resource manager unavailable: {0}")]
    Unavailable(String),
}

/// Cluster resource manager calls issued after a matching pass.
#[async_trait]
pub trait ResourceManager: Send + Sync {
    /// Accept an offer, launching exactly `launches` on it.
    async fn accept(
        &self,
        offer_id: &str,
        launches: &[Launch],
    ) -> std::result::Result<(), ResourceManagerError>;

    /// Decline offers in bulk.
    async fn decline(&self, offer_ids: &[String]) -> std::result::Result<(), ResourceManagerError>;
}
