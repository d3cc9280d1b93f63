// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Call-hooks: inline function calls started at one trigger and awaited at
//! the same or a later one.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::ids::EnvironmentId;

/// Call failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum CallError {
    /// The handler does not know the function.
    #[error("unknown function {0}")]
    UnknownFunction(String),
    /// The function ran and reported a failure.
    #[error("{0}")]
    Failed(String),
    /// The function did not return within its timeout.
    #[error("call {func} timed out after {timeout:?}")]
    Timeout {
        /// Function.
        func: String,
        /// Timeout applied.
        timeout: Duration,
    },
    /// The call was cancelled before it returned.
    #[error("call {0} cancelled")]
    Cancelled(String),
}

/// Everything a handler needs to run one call.
#[derive(Debug, Clone)]
pub struct CallRequest {
    /// Owning environment.
    pub env_id: EnvironmentId,
    /// Function to run, e.g. `odc.Configure`.
    pub func: String,
    /// Path of the call-role.
    pub role_path: String,
    /// Variable stack: role vars plus the `__call_*` keys.
    pub vars: BTreeMap<String, String>,
    /// Time the call is allowed to take.
    pub timeout: Duration,
    /// Fired when the call is cancelled; long-running handlers should watch it.
    pub cancel: CancellationToken,
}

/// Executes call-hooks on behalf of integration plugins.
#[async_trait]
pub trait CallHandler: Send + Sync {
    /// Run the call and return its output.
    async fn call(&self, request: CallRequest) -> Result<String, CallError>;
}

/// A started call that has not been awaited yet.
#[derive(Debug)]
pub struct PendingCall {
    role_path: String,
    func: String,
    critical: bool,
    return_var: Option<String>,
    cancel: CancellationToken,
    cancelled: AtomicBool,
    handle: JoinHandle<Result<String, CallError>>,
}

impl PendingCall {
    /// Spawn the call on the runtime. Returns immediately.
    pub fn start(
        handler: Arc<dyn CallHandler>,
        request: CallRequest,
        critical: bool,
        return_var: Option<String>,
    ) -> Self {
        let cancel = request.cancel.clone();
        let role_path = request.role_path.clone();
        let func = request.func.clone();
        let timeout = request.timeout;

        let task_cancel = cancel.clone();
        let task_func = func.clone();
        let handle = tokio::spawn(async move {
            debug!(func = %task_func, role = %request.role_path, "hook call started");
            tokio::select! {
                biased;
                _ = task_cancel.cancelled() => Err(CallError::Cancelled(task_func)),
                result = tokio::time::timeout(timeout, handler.call(request)) => match result {
                    Ok(output) => output,
                    Err(_) => Err(CallError::Timeout { func: task_func, timeout }),
                },
            }
        });

        Self {
            role_path,
            func,
            critical,
            return_var,
            cancel,
            cancelled: AtomicBool::new(false),
            handle,
        }
    }

    /// Path of the call-role.
    pub fn role_path(&self) -> &str {
        &self.role_path
    }

    /// Function name.
    pub fn func(&self) -> &str {
        &self.func
    }

    /// Whether a failure is critical.
    pub fn is_critical(&self) -> bool {
        self.critical
    }

    /// Runtime variable the output is stored in, if any.
    pub fn return_var(&self) -> Option<&str> {
        self.return_var.as_deref()
    }

    /// Cancel the call. Returns true only for the first cancellation.
    pub fn cancel(&self) -> bool {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.cancel.cancel();
        true
    }

    /// Wait for the call to finish.
    pub async fn wait(self) -> Result<String, CallError> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(CallError::Failed(format!("call {} panicked: {}", self.func, e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::MockCallHandler;

    fn request(func: &str, timeout: Duration) -> CallRequest {
        CallRequest {
            env_id: EnvironmentId::new(),
            func: func.into(),
            role_path: "root.call".into(),
            vars: BTreeMap::new(),
            timeout,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_call_returns_output() {
        let handler = Arc::new(MockCallHandler::new());
        let call = PendingCall::start(handler.clone(), request("bk.Notify", Duration::from_secs(1)), true, None);
        assert_eq!(call.wait().await, Ok("bk.Notify".to_string()));
        assert_eq!(handler.calls().await, vec!["root.call".to_string()]);
    }

    #[tokio::test]
    async fn test_cancel_is_true_only_once() {
        let handler = Arc::new(MockCallHandler::new().with_delay(Duration::from_secs(60)));
        let call = PendingCall::start(handler, request("slow", Duration::from_secs(120)), true, None);

        assert!(call.cancel());
        assert!(!call.cancel());
        assert_eq!(call.wait().await, Err(CallError::Cancelled("slow".into())));
    }

    #[tokio::test]
    async fn test_timeout() {
        let handler = Arc::new(MockCallHandler::new().with_delay(Duration::from_secs(60)));
        let call = PendingCall::start(handler, request("slow", Duration::from_millis(20)), false, None);
        assert!(!call.is_critical());
        assert!(matches!(call.wait().await, Err(CallError::Timeout { .. })));
    }
}
