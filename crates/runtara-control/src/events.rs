// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lifecycle event publication.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::ids::EnvironmentId;
use crate::state::{EnvState, Event};

/// One environment lifecycle notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnvironmentEvent {
    /// Environment.
    pub env_id: EnvironmentId,
    /// State at publication time.
    pub state: EnvState,
    /// Transition in progress, if any.
    pub transition: Option<Event>,
    /// Transition step (trigger name), if any.
    pub step: Option<String>,
    /// Human-readable message.
    pub message: String,
    /// Error, if the step failed.
    pub error: Option<String>,
    /// Current run number, 0 when none.
    pub run_number: u32,
    /// Environment variables worth exporting.
    pub vars: BTreeMap<String, String>,
    /// Publication time.
    pub timestamp: DateTime<Utc>,
}

impl EnvironmentEvent {
    /// Event with no transition, step, error or vars.
    pub fn new(env_id: EnvironmentId, state: EnvState, message: impl Into<String>) -> Self {
        Self {
            env_id,
            state,
            transition: None,
            step: None,
            message: message.into(),
            error: None,
            run_number: 0,
            vars: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// Attach the transition and step.
    pub fn in_transition(mut self, transition: Event, step: impl Into<String>) -> Self {
        self.transition = Some(transition);
        self.step = Some(step.into());
        self
    }

    /// Attach an error.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Attach the run number.
    pub fn with_run_number(mut self, run_number: u32) -> Self {
        self.run_number = run_number;
        self
    }
}

/// Receiver of lifecycle events. Publication never fails and never blocks.
pub trait EventSink: Send + Sync {
    /// Publish one event.
    fn publish(&self, event: EnvironmentEvent);
}

/// Logs events through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn publish(&self, event: EnvironmentEvent) {
        let transition = event.transition.map(|t| t.as_str()).unwrap_or("");
        let step = event.step.as_deref().unwrap_or("");
        match &event.error {
            Some(error) => warn!(
                env_id = %event.env_id,
                state = %event.state,
                transition,
                step,
                run_number = event.run_number,
                error = %error,
                "{}",
                event.message
            ),
            None => info!(
                env_id = %event.env_id,
                state = %event.state,
                transition,
                step,
                run_number = event.run_number,
                "{}",
                event.message
            ),
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Clone, Default)]
pub struct RecordingEventSink {
    events: Arc<Mutex<Vec<EnvironmentEvent>>>,
}

impl RecordingEventSink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Events published so far.
    pub fn events(&self) -> Vec<EnvironmentEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Events of one environment.
    pub fn events_for(&self, env_id: EnvironmentId) -> Vec<EnvironmentEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.env_id == env_id)
            .collect()
    }
}

impl EventSink for RecordingEventSink {
    fn publish(&self, event: EnvironmentEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_sink_filters_by_environment() {
        let sink = RecordingEventSink::new();
        let a = EnvironmentId::new();
        let b = EnvironmentId::new();
        sink.publish(EnvironmentEvent::new(a, EnvState::Deployed, "deployed"));
        sink.publish(
            EnvironmentEvent::new(b, EnvState::Standby, "failed")
                .in_transition(Event::Deploy, "DEPLOY")
                .with_error("boom"),
        );

        assert_eq!(sink.events().len(), 2);
        let for_b = sink.events_for(b);
        assert_eq!(for_b.len(), 1);
        assert_eq!(for_b[0].transition, Some(Event::Deploy));
        assert_eq!(for_b[0].error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_event_serializes() {
        let event = EnvironmentEvent::new(EnvironmentId::new(), EnvState::Running, "started")
            .with_run_number(42);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["state"], "RUNNING");
        assert_eq!(json["run_number"], 42);
    }
}
