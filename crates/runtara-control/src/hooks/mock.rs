// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock call handler for testing.
//!
//! Records the role path of every call in the order calls begin, returns the
//! function name as output and fails calls on request.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{CallError, CallHandler, CallRequest};

/// Call handler that records calls.
#[derive(Debug, Clone, Default)]
pub struct MockCallHandler {
    calls: Arc<Mutex<Vec<String>>>,
    requests: Arc<Mutex<Vec<CallRequest>>>,
    failing: HashSet<String>,
    delays: BTreeMap<String, Duration>,
    /// Delay applied to every call without a specific delay.
    pub default_delay: Duration,
}

impl MockCallHandler {
    /// Create a handler where every call succeeds immediately.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every call made by the role at `role_path`.
    pub fn failing_on(mut self, role_path: impl Into<String>) -> Self {
        self.failing.insert(role_path.into());
        self
    }

    /// Delay every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    /// Delay calls made by the role at `role_path`.
    pub fn with_delay_on(mut self, role_path: impl Into<String>, delay: Duration) -> Self {
        self.delays.insert(role_path.into(), delay);
        self
    }

    /// Role paths of every call, in the order calls began.
    pub async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }

    /// Full requests, in the order calls began.
    pub async fn requests(&self) -> Vec<CallRequest> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl CallHandler for MockCallHandler {
    async fn call(&self, request: CallRequest) -> Result<String, CallError> {
        self.calls.lock().await.push(request.role_path.clone());
        self.requests.lock().await.push(request.clone());

        let delay = self
            .delays
            .get(&request.role_path)
            .copied()
            .unwrap_or(self.default_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.failing.contains(&request.role_path) {
            return Err(CallError::Failed(format!("{} failed", request.func)));
        }
        Ok(request.func)
    }
}
