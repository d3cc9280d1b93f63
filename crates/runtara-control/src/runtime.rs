// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for runtara-control.
//!
//! This module provides [`ControlRuntime`], the composition root: it wires
//! the environment manager, the task coordinator and the event router
//! together and runs the background workers on the current tokio runtime.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use runtara_control::runtime::ControlRuntime;
//! use runtara_control::workflow::JsonWorkflowLoader;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = ControlRuntime::builder()
//!         .task_controller(Arc::new(MyTaskController::new()))
//!         .resource_manager(Arc::new(MyResourceManager::connect().await?))
//!         .workflow_loader(Arc::new(JsonWorkflowLoader::new("workflows")))
//!         .call_handler(Arc::new(MyCallHandler::default()))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // Feed offer batches from the cluster scheduler.
//!     let offers = runtime.offer_sender();
//!
//!     let manager = runtime.manager();
//!     let id = manager
//!         .create_environment("readout", Default::default(), false)
//!         .await?;
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::Config;
use crate::coordinator::{Mailboxes, TaskController, TaskManager};
use crate::events::{EventSink, TracingEventSink};
use crate::hooks::CallHandler;
use crate::manager::EnvironmentManager;
use crate::offers::{MatcherConfig, Offer, OfferMatcher, ResourceManager};
use crate::router::EventRouter;
use crate::workflow::WorkflowLoader;

/// Builder for creating a [`ControlRuntime`].
pub struct ControlRuntimeBuilder {
    task_controller: Option<Arc<dyn TaskController>>,
    resource_manager: Option<Arc<dyn ResourceManager>>,
    workflow_loader: Option<Arc<dyn WorkflowLoader>>,
    call_handler: Option<Arc<dyn CallHandler>>,
    event_sink: Arc<dyn EventSink>,
    config: Config,
    global_vars: BTreeMap<String, String>,
}

impl Default for ControlRuntimeBuilder {
    fn default() -> Self {
        Self {
            task_controller: None,
            resource_manager: None,
            workflow_loader: None,
            call_handler: None,
            event_sink: Arc::new(TracingEventSink),
            config: Config::default(),
            global_vars: BTreeMap::new(),
        }
    }
}

impl ControlRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the controller driving launched tasks (required).
    pub fn task_controller(mut self, controller: Arc<dyn TaskController>) -> Self {
        self.task_controller = Some(controller);
        self
    }

    /// Set the cluster resource manager (required).
    pub fn resource_manager(mut self, resources: Arc<dyn ResourceManager>) -> Self {
        self.resource_manager = Some(resources);
        self
    }

    /// Set the workflow template source (required).
    pub fn workflow_loader(mut self, loader: Arc<dyn WorkflowLoader>) -> Self {
        self.workflow_loader = Some(loader);
        self
    }

    /// Set the handler running call-hooks (required).
    pub fn call_handler(mut self, calls: Arc<dyn CallHandler>) -> Self {
        self.call_handler = Some(calls);
        self
    }

    /// Set the lifecycle event sink.
    ///
    /// Default: [`TracingEventSink`].
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Set timeouts, delays, port floors and channel sizes.
    ///
    /// Default: [`Config::default()`].
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Set the global variables every new environment starts with.
    ///
    /// Default: empty.
    pub fn global_vars(mut self, vars: BTreeMap<String, String>) -> Self {
        self.global_vars = vars;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<ControlRuntimeConfig> {
        let task_controller = self
            .task_controller
            .ok_or_else(|| anyhow::anyhow!("task_controller is required"))?;
        let resource_manager = self
            .resource_manager
            .ok_or_else(|| anyhow::anyhow!("resource_manager is required"))?;
        let workflow_loader = self
            .workflow_loader
            .ok_or_else(|| anyhow::anyhow!("workflow_loader is required"))?;
        let call_handler = self
            .call_handler
            .ok_or_else(|| anyhow::anyhow!("call_handler is required"))?;
        if self.config.channel_capacity == 0 {
            anyhow::bail!("channel_capacity must be positive");
        }

        Ok(ControlRuntimeConfig {
            task_controller,
            resource_manager,
            workflow_loader,
            call_handler,
            event_sink: self.event_sink,
            config: self.config,
            global_vars: self.global_vars,
        })
    }
}

/// Configuration for a [`ControlRuntime`].
pub struct ControlRuntimeConfig {
    task_controller: Arc<dyn TaskController>,
    resource_manager: Arc<dyn ResourceManager>,
    workflow_loader: Arc<dyn WorkflowLoader>,
    call_handler: Arc<dyn CallHandler>,
    event_sink: Arc<dyn EventSink>,
    config: Config,
    global_vars: BTreeMap<String, String>,
}

impl ControlRuntimeConfig {
    /// Start the runtime, spawning the task coordinator and the event router.
    pub async fn start(self) -> Result<ControlRuntime> {
        let capacity = self.config.channel_capacity;
        let (coordinator_tx, coordinator_rx) = mpsc::channel(capacity);
        let (offers_tx, offers_rx) = mpsc::channel(capacity);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mailboxes = Mailboxes::new();

        let matcher = OfferMatcher::new(MatcherConfig {
            tcp_port_min: self.config.tcp_port_min,
            control_port_min: self.config.control_port_min,
        });
        let deployment_timeout = self.config.deployment_timeout;

        let manager = Arc::new(
            EnvironmentManager::new(
                coordinator_tx,
                mailboxes.clone(),
                self.workflow_loader,
                self.call_handler,
                self.event_sink,
                self.config,
            )
            .with_global_vars(self.global_vars),
        );

        // Create task coordinator
        let task_manager = TaskManager::new(
            coordinator_rx,
            offers_rx,
            events_tx,
            self.task_controller,
            self.resource_manager,
            matcher,
        );
        let task_manager_shutdown = task_manager.shutdown_handle();
        let task_manager_handle = tokio::spawn(async move {
            task_manager.run().await;
        });

        // Create event router
        let router = EventRouter::new(events_rx, mailboxes, manager.clone());
        let router_shutdown = router.shutdown_handle();
        let router_handle = tokio::spawn(async move {
            router.run().await;
        });

        info!(
            channel_capacity = capacity,
            deployment_timeout = ?deployment_timeout,
            "ControlRuntime started"
        );

        Ok(ControlRuntime {
            manager,
            offers: offers_tx,
            task_manager_handle,
            router_handle,
            task_manager_shutdown,
            router_shutdown,
        })
    }
}

/// A running runtara-control instance that can be embedded in an application.
///
/// The runtime manages:
/// - Task coordinator matching offers and driving tasks
/// - Event router delivering coordinator replies to environments
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct ControlRuntime {
    manager: Arc<EnvironmentManager>,
    offers: mpsc::Sender<Vec<Offer>>,
    task_manager_handle: JoinHandle<()>,
    router_handle: JoinHandle<()>,
    task_manager_shutdown: Arc<Notify>,
    router_shutdown: Arc<Notify>,
}

impl ControlRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> ControlRuntimeBuilder {
        ControlRuntimeBuilder::new()
    }

    /// The control API.
    pub fn manager(&self) -> &Arc<EnvironmentManager> {
        &self.manager
    }

    /// Channel accepting batches of resource offers.
    pub fn offer_sender(&self) -> mpsc::Sender<Vec<Offer>> {
        self.offers.clone()
    }

    /// Gracefully shut down the runtime.
    ///
    /// This signals the event router and the task coordinator to stop, then
    /// waits for them to complete. Live environments are not torn down.
    pub async fn shutdown(self) -> Result<()> {
        info!("ControlRuntime shutting down...");

        self.router_shutdown.notify_one();
        self.task_manager_shutdown.notify_one();

        if let Err(e) = self.router_handle.await {
            error!("Event router task panicked: {}", e);
        }

        match self.task_manager_handle.await {
            Ok(()) => {
                info!("ControlRuntime shutdown complete");
                Ok(())
            }
            Err(e) => {
                error!("Task manager task panicked: {}", e);
                Err(anyhow::anyhow!("task manager task panicked: {}", e))
            }
        }
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.task_manager_handle.is_finished() && !self.router_handle.is_finished()
    }
}
