// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for runtara-control integration tests.
//!
//! Provides TestContext, which runs a full control runtime against the mock
//! collaborators and keeps a host offering resources in the background.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use runtara_control::config::Config;
use runtara_control::coordinator::MockTaskController;
use runtara_control::events::RecordingEventSink;
use runtara_control::hooks::{HookTraits, MockCallHandler};
use runtara_control::offers::{Attributes, MACHINE_ID_ATTRIBUTE, MockResourceManager, Offer, Ranges};
use runtara_control::runtime::ControlRuntime;
use runtara_control::workflow::{CallRole, Role, StaticWorkflowLoader, TaskClass, TaskRole};
use runtara_control::{Environment, EnvironmentManager};

/// Hostname of the background offer feeder.
pub const HOSTNAME: &str = "flp001";

/// Configuration with timeouts short enough for tests.
pub fn test_config() -> Config {
    Config {
        deployment_timeout: Duration::from_secs(2),
        hook_timeout: Duration::from_secs(1),
        reaction_delay: Duration::from_millis(20),
        ..Config::default()
    }
}

/// A critical task-role with modest wants.
pub fn task(name: &str) -> Role {
    Role::task(name, TaskRole::new(class(name)))
}

/// A task-role claiming `detector`.
pub fn detector_task(name: &str, detector: &str) -> Role {
    Role::task(name, TaskRole::new(class(name)).with_detector(detector))
}

/// A non-critical task-role.
pub fn optional_task(name: &str) -> Role {
    Role::task(name, TaskRole::new(class(name)).non_critical())
}

/// A task-hook fired at `trigger`.
pub fn task_hook(name: &str, trigger: &str) -> Role {
    Role::task(name, TaskRole::new(class(name)).as_hook(HookTraits::new(trigger)))
}

/// A critical call-hook fired at `trigger`.
pub fn call_hook(name: &str, trigger: &str) -> Role {
    call_hook_with(name, HookTraits::new(trigger))
}

/// A call-hook with explicit traits. The function name is `<name>.Run`.
pub fn call_hook_with(name: &str, traits: HookTraits) -> Role {
    Role::call(name, CallRole::new(format!("{name}.Run"), traits))
}

fn class(name: &str) -> TaskClass {
    TaskClass::new(name, format!("/opt/bin/{name}")).with_wants(1.0, 256.0)
}

/// A generous offer from `hostname`.
pub fn offer(id: impl Into<String>, hostname: &str) -> Offer {
    Offer::new(id, hostname, 64.0, 65536.0, Ranges::span(10000, 40000))
        .with_attributes(Attributes::new([(MACHINE_ID_ATTRIBUTE, hostname)]))
}

/// Builder for [`TestContext`].
pub struct TestContextBuilder {
    loader: StaticWorkflowLoader,
    controller: MockTaskController,
    calls: MockCallHandler,
    config: Config,
    feed_offers: bool,
}

impl TestContextBuilder {
    /// Register a workflow. The tree is finalized by the loader.
    pub fn workflow(mut self, reference: &str, root: Role) -> Self {
        self.loader = self.loader.with_workflow(reference, root);
        self
    }

    /// Use a scripted task controller.
    pub fn controller(mut self, controller: MockTaskController) -> Self {
        self.controller = controller;
        self
    }

    /// Use a scripted call handler.
    pub fn calls(mut self, calls: MockCallHandler) -> Self {
        self.calls = calls;
        self
    }

    /// Adjust the configuration.
    pub fn config(mut self, adjust: impl FnOnce(&mut Config)) -> Self {
        adjust(&mut self.config);
        self
    }

    /// Do not offer resources in the background.
    pub fn without_offers(mut self) -> Self {
        self.feed_offers = false;
        self
    }

    /// Start the runtime.
    pub async fn start(self) -> TestContext {
        let controller = Arc::new(self.controller);
        let resources = Arc::new(MockResourceManager::new());
        let calls = Arc::new(self.calls);
        let sink = RecordingEventSink::new();

        let runtime = ControlRuntime::builder()
            .task_controller(controller.clone())
            .resource_manager(resources.clone())
            .workflow_loader(Arc::new(self.loader))
            .call_handler(calls.clone())
            .event_sink(Arc::new(sink.clone()))
            .config(self.config)
            .build()
            .expect("Failed to build runtime")
            .start()
            .await
            .expect("Failed to start runtime");

        let offers = runtime.offer_sender();
        let feeder = self.feed_offers.then(|| tokio::spawn(feed_offers(offers)));

        TestContext {
            runtime: Some(runtime),
            controller,
            resources,
            calls,
            sink,
            feeder,
        }
    }
}

/// A running control runtime with mock collaborators.
pub struct TestContext {
    runtime: Option<ControlRuntime>,
    pub controller: Arc<MockTaskController>,
    pub resources: Arc<MockResourceManager>,
    pub calls: Arc<MockCallHandler>,
    pub sink: RecordingEventSink,
    feeder: Option<JoinHandle<()>>,
}

impl TestContext {
    /// Start building a context.
    pub fn builder() -> TestContextBuilder {
        TestContextBuilder {
            loader: StaticWorkflowLoader::new(),
            controller: MockTaskController::new(),
            calls: MockCallHandler::new(),
            config: test_config(),
            feed_offers: true,
        }
    }

    /// The control API.
    pub fn manager(&self) -> &Arc<EnvironmentManager> {
        self.runtime
            .as_ref()
            .expect("runtime already shut down")
            .manager()
    }

    /// Channel accepting offer batches.
    pub fn offer_sender(&self) -> mpsc::Sender<Vec<Offer>> {
        self.runtime
            .as_ref()
            .expect("runtime already shut down")
            .offer_sender()
    }

    /// A live environment.
    pub fn environment(&self, id: runtara_control::EnvironmentId) -> Arc<Environment> {
        self.manager().environment(id).expect("environment not found")
    }

    /// Stop the offer feeder and the runtime workers.
    pub async fn shutdown(mut self) {
        if let Some(feeder) = self.feeder.take() {
            feeder.abort();
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown().await.expect("Failed to shut down runtime");
        }
    }
}

/// Offer one generous host every few milliseconds.
async fn feed_offers(offers: mpsc::Sender<Vec<Offer>>) {
    let mut sequence = 0u64;
    loop {
        sequence += 1;
        if offers
            .send(vec![offer(format!("offer-{sequence}"), HOSTNAME)])
            .await
            .is_err()
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll `condition` until it holds or `timeout` passes. Returns whether it held.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
