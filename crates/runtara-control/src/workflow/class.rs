// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task classes: what a task-role needs in order to be placed and launched.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::offers::Ranges;

/// How the launched process is driven.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlMode {
    /// The process implements the control protocol itself.
    #[default]
    Direct,
    /// FairMQ device, driven through its plugin; receives `--control-port`.
    Fairmq,
    /// Plain process with no state machine of its own.
    Basic,
}

/// Address family of an inbound channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Addressing {
    /// Bind a TCP port taken from the offer.
    #[default]
    Tcp,
    /// Bind a local IPC endpoint.
    Ipc,
}

/// A channel the task binds (listens on).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundChannel {
    /// Channel name.
    pub name: String,
    /// Optional workflow-wide alias.
    #[serde(default)]
    pub global: Option<String>,
    /// Address family used when `target` is empty.
    #[serde(default)]
    pub addressing: Addressing,
    /// Static bind address; overrides automatic assignment.
    #[serde(default)]
    pub target: Option<String>,
}

impl InboundChannel {
    /// A TCP inbound channel with automatic port assignment.
    pub fn tcp(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            global: None,
            addressing: Addressing::Tcp,
            target: None,
        }
    }

    /// An IPC inbound channel.
    pub fn ipc(name: impl Into<String>) -> Self {
        Self {
            addressing: Addressing::Ipc,
            ..Self::tcp(name)
        }
    }

    /// Register the channel under a global alias.
    pub fn with_global(mut self, global: impl Into<String>) -> Self {
        self.global = Some(global.into());
        self
    }
}

/// A channel the task connects to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundChannel {
    /// Channel name.
    pub name: String,
    /// `tcp://host:port`, `ipc://name`, `path.to.role:channel` or a global alias.
    pub target: String,
}

/// Resource limits. `None` means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Limits {
    /// CPU limit.
    #[serde(default)]
    pub cpu: Option<f64>,
    /// Memory limit in MB.
    #[serde(default)]
    pub memory: Option<f64>,
}

/// Launch template and resource wants of a task-role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskClass {
    /// Class name.
    pub name: String,
    /// Control mode.
    #[serde(default)]
    pub control: ControlMode,
    /// Executable.
    pub command: String,
    /// Arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// CPU wanted.
    #[serde(default)]
    pub cpu: f64,
    /// Memory wanted, in MB.
    #[serde(default)]
    pub memory: f64,
    /// Static ports wanted.
    #[serde(default)]
    pub ports: Ranges,
    /// Channels to bind.
    #[serde(default)]
    pub bind: Vec<InboundChannel>,
    /// Channels to connect.
    #[serde(default)]
    pub connect: Vec<OutboundChannel>,
    /// Resource limits.
    #[serde(default)]
    pub limits: Limits,
}

impl TaskClass {
    /// A class with no wants.
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            control: ControlMode::default(),
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cpu: 0.0,
            memory: 0.0,
            ports: Ranges::default(),
            bind: Vec::new(),
            connect: Vec::new(),
            limits: Limits::default(),
        }
    }

    /// Set scalar wants.
    pub fn with_wants(mut self, cpu: f64, memory: f64) -> Self {
        self.cpu = cpu;
        self.memory = memory;
        self
    }

    /// Set static port wants.
    pub fn with_ports(mut self, ports: Ranges) -> Self {
        self.ports = ports;
        self
    }

    /// Set the control mode.
    pub fn with_control(mut self, control: ControlMode) -> Self {
        self.control = control;
        self
    }

    /// Add an inbound channel.
    pub fn with_inbound(mut self, channel: InboundChannel) -> Self {
        self.bind.push(channel);
        self
    }
}
