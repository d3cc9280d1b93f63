// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run bookkeeping: run numbers, run timestamps, the cleanup counter and
//! auto stop.

mod common;

use std::collections::BTreeMap;
use std::time::Duration;

use common::{HOSTNAME, TestContext, task, wait_until};
use runtara_control::coordinator::{MockTaskController, TaskCommand};
use runtara_control::workflow::{Role, TaskState};
use runtara_control::{EnvState, Environment, Error, Event};

fn workflow() -> Role {
    Role::aggregator("root", vec![task("readout"), task("processor")])
}

fn millis(env: &Environment, key: &str) -> u64 {
    env.runtime_var(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or_else(|| panic!("{key} not set: {:?}", env.runtime_var(key)))
}

fn is_empty(env: &Environment, key: &str) -> bool {
    env.runtime_var(key).is_none_or(|v| v.is_empty())
}

#[tokio::test]
async fn test_run_numbers_and_timestamps() {
    let ctx = TestContext::builder()
        .workflow("readout", workflow())
        .config(|c| c.first_run_number = 42)
        .start()
        .await;
    let manager = ctx.manager().clone();
    let id = manager
        .create_environment("readout", BTreeMap::new(), false)
        .await
        .unwrap();
    let env = ctx.environment(id);
    assert_eq!(env.run_number(), 0);
    assert_eq!(env.global_var("__fmq_cleanup_count").as_deref(), Some("0"));

    manager
        .control_environment(id, Event::StartActivity)
        .await
        .unwrap();
    assert_eq!(env.run_number(), 42);
    assert_eq!(env.runtime_var("run_number").as_deref(), Some("42"));
    assert_eq!(env.runtime_var("runNumber").as_deref(), Some("42"));
    let started = millis(&env, "run_start_time_ms");
    assert!(millis(&env, "run_start_completion_time_ms") >= started);
    assert!(is_empty(&env, "run_end_time_ms"));
    assert!(is_empty(&env, "run_end_completion_time_ms"));
    assert_eq!(env.global_var("__fmq_cleanup_count").as_deref(), Some("1"));

    manager
        .control_environment(id, Event::StopActivity)
        .await
        .unwrap();
    assert_eq!(env.run_number(), 0);
    assert_eq!(env.last_run_number(), 42);
    assert_eq!(env.runtime_var("last_run_number").as_deref(), Some("42"));
    assert!(is_empty(&env, "run_number"));
    let ended = millis(&env, "run_end_time_ms");
    assert!(ended >= started);
    assert!(millis(&env, "run_end_completion_time_ms") >= ended);

    manager
        .control_environment(id, Event::StartActivity)
        .await
        .unwrap();
    assert_eq!(env.run_number(), 43);
    assert!(is_empty(&env, "run_end_time_ms"));
    assert_eq!(env.global_var("__fmq_cleanup_count").as_deref(), Some("2"));

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_run_numbers_are_shared_between_environments() {
    let ctx = TestContext::builder()
        .workflow("a", Role::aggregator("a", vec![task("readout")]))
        .workflow("b", Role::aggregator("b", vec![task("readout")]))
        .start()
        .await;
    let manager = ctx.manager().clone();
    let a = manager
        .create_environment("a", BTreeMap::new(), false)
        .await
        .unwrap();
    let b = manager
        .create_environment("b", BTreeMap::new(), false)
        .await
        .unwrap();

    manager
        .control_environment(a, Event::StartActivity)
        .await
        .unwrap();
    manager
        .control_environment(b, Event::StartActivity)
        .await
        .unwrap();

    assert_eq!(ctx.environment(a).run_number(), 1);
    assert_eq!(ctx.environment(b).run_number(), 2);

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_failed_start_then_go_error() {
    let ctx = TestContext::builder()
        .workflow("readout", workflow())
        .controller(MockTaskController::new().failing_on("root.readout", TaskCommand::Start))
        .start()
        .await;
    let manager = ctx.manager().clone();
    let id = manager
        .create_environment("readout", BTreeMap::new(), false)
        .await
        .unwrap();
    let env = ctx.environment(id);

    let err = manager
        .control_environment(id, Event::StartActivity)
        .await
        .unwrap_err();
    assert!(matches!(err.root(), Error::Coordination(_)));
    assert!(
        err.to_string().contains(&format!(
            "critical task 'root.readout' on host '{HOSTNAME}' transitioned to ERROR"
        )),
        "{err}"
    );
    assert_eq!(env.state(), EnvState::Configured);
    assert_eq!(env.run_number(), 0);
    assert!(!is_empty(&env, "run_start_time_ms"));
    assert!(is_empty(&env, "run_end_time_ms"));
    assert_eq!(env.global_var("__fmq_cleanup_count").as_deref(), Some("0"));

    let state = manager
        .control_environment(id, Event::GoError)
        .await
        .unwrap();
    assert_eq!(state, EnvState::Error);
    let ended = millis(&env, "run_end_time_ms");
    assert!(millis(&env, "run_end_completion_time_ms") >= ended);
    assert_eq!(env.last_run_number(), 0);
    // GO_ERROR stopped the task that did start
    assert!(
        env.tasks()
            .iter()
            .all(|t| t.state != TaskState::Running)
    );

    let state = manager.control_environment(id, Event::Reset).await.unwrap();
    assert_eq!(state, EnvState::Standby);
    assert!(env.tasks().iter().all(|t| t.state == TaskState::Standby));

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_auto_stop_ends_the_run() {
    let ctx = TestContext::builder()
        .workflow("readout", workflow())
        .start()
        .await;
    let manager = ctx.manager().clone();
    let vars = BTreeMap::from([
        ("auto_stop_enabled".to_string(), "true".to_string()),
        ("auto_stop_timeout".to_string(), "200ms".to_string()),
    ]);
    let id = manager
        .create_environment("readout", vars, false)
        .await
        .unwrap();
    let env = ctx.environment(id);

    manager
        .control_environment(id, Event::StartActivity)
        .await
        .unwrap();
    let run = env.run_number();
    assert_eq!(env.state(), EnvState::Running);

    assert!(wait_until(Duration::from_secs(3), || env.state() == EnvState::Configured).await);
    assert_eq!(env.last_run_number(), run);
    assert_eq!(env.run_number(), 0);

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_auto_stop_disabled_by_default() {
    let ctx = TestContext::builder()
        .workflow("readout", workflow())
        .start()
        .await;
    let manager = ctx.manager().clone();
    let vars = BTreeMap::from([("auto_stop_timeout".to_string(), "50ms".to_string())]);
    let id = manager
        .create_environment("readout", vars, false)
        .await
        .unwrap();
    let env = ctx.environment(id);

    manager
        .control_environment(id, Event::StartActivity)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(env.state(), EnvState::Running);

    ctx.shutdown().await;
}
