// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-environment reply mailboxes.
//!
//! An environment subscribes before sending a coordinator message and keeps
//! the [`Subscription`] until it has its answer. Dropping the subscription
//! unregisters the mailbox, so every exit path of a wait cleans up.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::mpsc;

use super::message::TaskEvent;
use crate::ids::EnvironmentId;

type Table = HashMap<EnvironmentId, (u64, mpsc::UnboundedSender<TaskEvent>)>;

/// Routing table from environment id to the waiter of that environment.
#[derive(Debug, Clone, Default)]
pub struct Mailboxes {
    inner: Arc<RwLock<Table>>,
    next_token: Arc<std::sync::atomic::AtomicU64>,
}

impl Mailboxes {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mailbox for `env_id`, replacing any previous one.
    pub fn subscribe(&self, env_id: EnvironmentId) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = self
            .next_token
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(env_id, (token, tx));
        Subscription {
            env_id,
            token,
            rx,
            mailboxes: self.clone(),
        }
    }

    /// Deliver to the waiter of the event's environment. Returns the event
    /// back when nobody is waiting.
    pub fn deliver(&self, event: TaskEvent) -> Result<(), TaskEvent> {
        let env_id = event.env_id();
        let table = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        match table.get(&env_id) {
            Some((_, tx)) => tx.send(event).map_err(|e| e.0),
            None => Err(event),
        }
    }

    /// Whether a waiter is registered for `env_id`.
    pub fn is_subscribed(&self, env_id: EnvironmentId) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&env_id)
    }

    fn unsubscribe(&self, env_id: EnvironmentId, token: u64) {
        let mut table = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if table.get(&env_id).is_some_and(|(t, _)| *t == token) {
            table.remove(&env_id);
        }
    }
}

/// A registered mailbox. Unregisters on drop.
#[derive(Debug)]
pub struct Subscription {
    env_id: EnvironmentId,
    token: u64,
    rx: mpsc::UnboundedReceiver<TaskEvent>,
    mailboxes: Mailboxes,
}

impl Subscription {
    /// Next event for this environment.
    pub async fn recv(&mut self) -> Option<TaskEvent> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.mailboxes.unsubscribe(self.env_id, self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::TaskId;
    use crate::workflow::TaskState;

    fn event(env_id: EnvironmentId) -> TaskEvent {
        TaskEvent::state_changed(env_id, [TaskId::from("t1")], TaskState::Configured)
    }

    #[tokio::test]
    async fn test_deliver_to_subscriber() {
        let mailboxes = Mailboxes::new();
        let env_id = EnvironmentId::new();
        let mut sub = mailboxes.subscribe(env_id);

        mailboxes.deliver(event(env_id)).unwrap();
        assert_eq!(sub.recv().await, Some(event(env_id)));
    }

    #[test]
    fn test_deliver_without_waiter_returns_event() {
        let mailboxes = Mailboxes::new();
        let env_id = EnvironmentId::new();
        assert_eq!(mailboxes.deliver(event(env_id)), Err(event(env_id)));
    }

    #[test]
    fn test_drop_unsubscribes() {
        let mailboxes = Mailboxes::new();
        let env_id = EnvironmentId::new();
        let sub = mailboxes.subscribe(env_id);
        assert!(mailboxes.is_subscribed(env_id));
        drop(sub);
        assert!(!mailboxes.is_subscribed(env_id));
    }

    #[test]
    fn test_stale_subscription_does_not_remove_newer_one() {
        let mailboxes = Mailboxes::new();
        let env_id = EnvironmentId::new();
        let old = mailboxes.subscribe(env_id);
        let _new = mailboxes.subscribe(env_id);
        drop(old);
        assert!(mailboxes.is_subscribed(env_id));
    }
}
