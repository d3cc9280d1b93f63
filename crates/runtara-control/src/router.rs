// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Event router.
//!
//! Delivers every [`TaskEvent`] from the task coordinator to the mailbox of
//! its environment. Events nobody is waiting for go to the environment
//! manager.

use std::sync::Arc;

use tokio::sync::{Notify, mpsc};
use tracing::{debug, info};

use crate::coordinator::{Mailboxes, TaskEvent};
use crate::manager::EnvironmentManager;

/// Background worker routing coordinator events.
pub struct EventRouter {
    events: mpsc::UnboundedReceiver<TaskEvent>,
    mailboxes: Mailboxes,
    manager: Arc<EnvironmentManager>,
    shutdown: Arc<Notify>,
}

impl EventRouter {
    /// Create a router reading `events`.
    pub fn new(
        events: mpsc::UnboundedReceiver<TaskEvent>,
        mailboxes: Mailboxes,
        manager: Arc<EnvironmentManager>,
    ) -> Self {
        Self {
            events,
            mailboxes,
            manager,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the routing loop until shutdown.
    pub async fn run(mut self) {
        info!("Event router started");

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Event router received shutdown signal");
                    break;
                }

                Some(event) = self.events.recv() => {
                    if let Err(event) = self.mailboxes.deliver(event) {
                        debug!(env_id = %event.env_id(), "unsolicited coordinator event");
                        self.manager.handle_task_event(event);
                    }
                }
            }
        }

        info!("Event router stopped");
    }
}
