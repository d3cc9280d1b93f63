// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task coordination.
//!
//! Environments talk to the coordinator with [`EnvironmentMessage`]s on an
//! mpsc channel. The coordinator answers with [`TaskEvent`]s, which the
//! event router delivers to the environment's [`Mailboxes`] entry or, when
//! no transition is waiting, to the environment manager.

mod controller;
mod mailbox;
mod message;
pub mod mock;
mod task_manager;

pub use controller::{ControllerError, TaskController, TaskExit, TaskHandle, TaskNotice};
pub use mailbox::{Mailboxes, Subscription};
pub use message::{EnvironmentMessage, TaskCommand, TaskEvent};
pub use mock::MockTaskController;
pub use task_manager::TaskManager;
