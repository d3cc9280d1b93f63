// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtara Control - Environment Lifecycle Control Plane
//!
//! This crate deploys workflows as environments: trees of roles backed by
//! launched tasks, driven together through one lifecycle state machine with
//! user-defined hooks at every step.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            Control API                                  │
//! │        create_environment / control_environment / destroy_environment   │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       EnvironmentManager                                │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐     │
//! │  │ Environment │  │ Environment │  │    Hook     │  │   Workflow  │     │
//! │  │     FSM     │  │  Role Tree  │  │   Engine    │  │    Loader   │     │
//! │  └─────────────┘  └─────────────┘  └─────────────┘  └─────────────┘     │
//! └─────────────────────────────────────────────────────────────────────────┘
//!           │ EnvironmentMessage (mpsc)              ▲ TaskEvent (mailboxes)
//!           ▼                                        │
//! ┌───────────────────────────────┐        ┌───────────────────────────────┐
//! │        TaskManager            │───────▶│         EventRouter           │
//! │  (task coordinator)           │        └───────────────────────────────┘
//! │  ┌─────────────────────────┐  │
//! │  │      OfferMatcher       │◄─┼──── resource offers (mpsc)
//! │  └─────────────────────────┘  │
//! └───────────────────────────────┘
//!           │ accept / decline            │ configure / transition / kill
//!           ▼                             ▼
//!   ┌──────────────────┐         ┌──────────────────┐
//!   │ ResourceManager  │         │  TaskController  │
//!   └──────────────────┘         └──────────────────┘
//! ```
//!
//! # Environment State Machine
//!
//! ```text
//!   STANDBY ──DEPLOY──▶ DEPLOYED ──CONFIGURE──▶ CONFIGURED ◀──CONFIGURE
//!      ▲                   │                     │    ▲
//!      │                   │         START_ACTIVITY  STOP_ACTIVITY
//!      │                   │                     ▼    │
//!      │                   │                    RUNNING
//!      │                GO_ERROR (from DEPLOYED, CONFIGURED, RUNNING)
//!      │                   ▼
//!      └─────RESET───── ERROR           EXIT: STANDBY, CONFIGURED ──▶ DONE
//!            (also from CONFIGURED)
//! ```
//!
//! Every transition runs its hooks in this order:
//!
//! ```text
//! before_<EVENT>  ->  leave_<FROM>  ->  do()  ->  commit  ->  enter_<TO>  ->  after_<EVENT>
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `RUNTARA_CONTROL_DEPLOYMENT_TIMEOUT_SECS` | `90` | Bound on every wait for task replies |
//! | `RUNTARA_CONTROL_HOOK_TIMEOUT_SECS` | `30` | Timeout of hooks that declare none |
//! | `RUNTARA_CONTROL_REACTION_DELAY_MS` | `500` | Delay before reacting to a critical task failure |
//! | `RUNTARA_CONTROL_TCP_PORT_MIN` | `9000` | Lowest port for TCP inbound channels |
//! | `RUNTARA_CONTROL_CONTROL_PORT_MIN` | `30000` | Lowest task control port |
//! | `RUNTARA_CONTROL_CHANNEL_CAPACITY` | `1024` | Coordinator channel capacity |
//! | `RUNTARA_CONTROL_WORKFLOW_DIR` | `workflows` | Directory of workflow templates |
//! | `RUNTARA_CONTROL_FIRST_RUN_NUMBER` | `1` | First run number handed out |
//!
//! # Modules
//!
//! - [`config`]: Configuration from environment variables
//! - [`error`]: Error types for control plane operations
//! - [`state`]: Environment states, events and the transition table
//! - [`workflow`]: Role trees, task classes and workflow loading
//! - [`hooks`]: Call-hooks, task-hooks and the hook engine
//! - [`coordinator`]: Messages, mailboxes and the task coordinator worker
//! - [`offers`]: Resource offers and the offer matcher
//! - [`environment`]: One deployed workflow and its transitions
//! - [`manager`]: The control API
//! - [`router`]: Delivery of coordinator replies
//! - [`events`]: Lifecycle event publication
//! - [`runtime`]: Composition root and background workers

#![deny(missing_docs)]

/// Configuration loaded from environment variables.
pub mod config;

/// Task coordination: messages, mailboxes and the coordinator worker.
pub mod coordinator;

/// A deployed workflow and its lifecycle.
pub mod environment;

/// Error types for control plane operations.
pub mod error;

/// Lifecycle event publication.
pub mod events;

/// Lifecycle hooks.
pub mod hooks;

/// Environment and task identifiers.
pub mod ids;

/// The environment manager.
pub mod manager;

/// Resource offers and matching.
pub mod offers;

/// Coordinator event routing.
pub mod router;

/// Embeddable runtime for runtara-control.
pub mod runtime;

/// Environment lifecycle states and events.
pub mod state;

/// Role trees and workflow templates.
pub mod workflow;

pub use config::Config;
pub use environment::Environment;
pub use error::{Error, Result};
pub use ids::{EnvironmentId, TaskId};
pub use manager::EnvironmentManager;
pub use state::{EnvState, Event};
