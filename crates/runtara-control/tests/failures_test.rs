// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Failure handling: task deaths, timeouts, concurrent requests and failed
//! deployments.

mod common;

use std::collections::BTreeMap;
use std::time::Duration;

use common::{TestContext, call_hook, optional_task, task, wait_until};
use runtara_control::coordinator::{MockTaskController, TaskCommand};
use runtara_control::hooks::MockCallHandler;
use runtara_control::offers::{Constraint, Constraints, MACHINE_ID_ATTRIBUTE};
use runtara_control::workflow::{Role, TaskState};
use runtara_control::{EnvState, Error, Event};

fn workflow() -> Role {
    Role::aggregator("root", vec![task("readout"), task("processor")])
}

fn task_id(env: &runtara_control::Environment, role_path: &str) -> runtara_control::TaskId {
    env.tasks()
        .into_iter()
        .find(|t| t.role_path == role_path)
        .map(|t| t.task_id)
        .unwrap_or_else(|| panic!("no task bound to {role_path}"))
}

#[tokio::test]
async fn test_critical_task_crash_moves_environment_to_error() {
    let ctx = TestContext::builder()
        .workflow("readout", workflow())
        .start()
        .await;
    let manager = ctx.manager().clone();
    let id = manager
        .create_environment("readout", BTreeMap::new(), false)
        .await
        .unwrap();
    manager
        .control_environment(id, Event::StartActivity)
        .await
        .unwrap();
    let env = ctx.environment(id);

    ctx.controller.crash(&task_id(&env, "root.readout"), 137);

    assert!(wait_until(Duration::from_secs(2), || env.state() == EnvState::Error).await);
    let workflow = env.workflow();
    let readout = workflow.find("root.readout").unwrap();
    assert_eq!(readout.runtime_var("taskResult.exitCode"), Some("137"));
    assert_eq!(readout.runtime_var("taskResult.voluntary"), Some("false"));

    // the surviving task was stopped by GO_ERROR
    assert!(
        wait_until(Duration::from_secs(2), || {
            env.tasks()
                .iter()
                .any(|t| t.role_path == "root.processor" && t.state == TaskState::Configured)
        })
        .await
    );
    assert_eq!(env.run_number(), 0);

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_crash_during_transition_ends_in_error_after_it() {
    let ctx = TestContext::builder()
        .workflow(
            "slow-start",
            Role::aggregator(
                "root",
                vec![
                    task("readout"),
                    task("processor"),
                    call_hook("prepare", "before_START_ACTIVITY"),
                ],
            ),
        )
        .calls(MockCallHandler::new().with_delay_on("root.prepare", Duration::from_millis(400)))
        .start()
        .await;
    let manager = ctx.manager().clone();
    let id = manager
        .create_environment("slow-start", BTreeMap::new(), false)
        .await
        .unwrap();
    let env = ctx.environment(id);

    let starting = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.control_environment(id, Event::StartActivity).await })
    };
    assert!(
        wait_until(Duration::from_secs(1), || {
            env.current_transition() == Some(Event::StartActivity)
        })
        .await
    );
    ctx.controller.crash(&task_id(&env, "root.readout"), 137);

    // the reaction waits for START instead of forcing ERROR underneath it
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(env.state(), EnvState::Configured);
    assert_eq!(env.current_transition(), Some(Event::StartActivity));

    let _ = starting.await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || env.state() == EnvState::Error).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(env.state(), EnvState::Error);
    assert!(env.tasks().iter().all(|t| t.state != TaskState::Running));

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_non_critical_task_crash_is_tolerated() {
    let ctx = TestContext::builder()
        .workflow(
            "monitored",
            Role::aggregator("root", vec![task("readout"), optional_task("monitor")]),
        )
        .start()
        .await;
    let manager = ctx.manager().clone();
    let id = manager
        .create_environment("monitored", BTreeMap::new(), false)
        .await
        .unwrap();
    manager
        .control_environment(id, Event::StartActivity)
        .await
        .unwrap();
    let env = ctx.environment(id);

    ctx.controller.crash(&task_id(&env, "root.monitor"), 1);
    assert!(
        wait_until(Duration::from_secs(1), || {
            env.tasks()
                .iter()
                .any(|t| t.role_path == "root.monitor" && t.state == TaskState::Error)
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(env.state(), EnvState::Running);

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_non_critical_death_during_transition_times_out_and_recovers() {
    let ctx = TestContext::builder()
        .workflow(
            "monitored",
            Role::aggregator("root", vec![task("readout"), optional_task("monitor")]),
        )
        .controller(MockTaskController::new().failing_on("root.monitor", TaskCommand::Start))
        .config(|c| c.deployment_timeout = Duration::from_millis(300))
        .start()
        .await;
    let manager = ctx.manager().clone();
    let id = manager
        .create_environment("monitored", BTreeMap::new(), false)
        .await
        .unwrap();
    let env = ctx.environment(id);

    let err = manager
        .control_environment(id, Event::StartActivity)
        .await
        .unwrap_err();
    assert!(matches!(err.root(), Error::Timeout(_)), "{err}");
    assert!(
        err.to_string()
            .contains("waiting for 2 tasks to reach RUNNING"),
        "{err}"
    );
    assert_eq!(env.state(), EnvState::Configured);
    assert_eq!(env.run_number(), 0);

    // still recoverable
    for (event, expected) in [
        (Event::GoError, EnvState::Error),
        (Event::Reset, EnvState::Standby),
        (Event::Deploy, EnvState::Deployed),
        (Event::Configure, EnvState::Configured),
    ] {
        assert_eq!(manager.control_environment(id, event).await.unwrap(), expected);
    }
    assert!(env.tasks().iter().all(|t| t.state == TaskState::Configured));

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_transition_fails_fast() {
    let ctx = TestContext::builder()
        .workflow("readout", workflow())
        .controller(MockTaskController::new().with_delay(Duration::from_millis(300)))
        .start()
        .await;
    let manager = ctx.manager().clone();
    let id = manager
        .create_environment("readout", BTreeMap::new(), false)
        .await
        .unwrap();
    let env = ctx.environment(id);

    let starting = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.control_environment(id, Event::StartActivity).await })
    };
    assert!(
        wait_until(Duration::from_secs(1), || {
            env.current_transition() == Some(Event::StartActivity)
        })
        .await
    );

    let begun = tokio::time::Instant::now();
    let err = manager
        .control_environment(id, Event::StopActivity)
        .await
        .unwrap_err();
    assert!(begun.elapsed() < Duration::from_millis(100));
    assert!(
        matches!(
            err.root(),
            Error::TransitionInProgress {
                event: Event::StopActivity
            }
        ),
        "{err}"
    );

    let err = env.teardown(false, &mut Vec::new()).await.unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)), "{err}");

    assert_eq!(starting.await.unwrap().unwrap(), EnvState::Running);

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_failed_configure_aborts_creation() {
    let ctx = TestContext::builder()
        .workflow("readout", workflow())
        .controller(MockTaskController::new().failing_on("root.readout", TaskCommand::Configure))
        .start()
        .await;
    let manager = ctx.manager().clone();

    let err = manager
        .create_environment("readout", BTreeMap::new(), false)
        .await
        .unwrap_err();

    match &err {
        Error::Environment { operation, .. } => assert_eq!(operation, "CONFIGURE"),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(matches!(err.root(), Error::Coordination(_)));
    assert!(manager.ids().is_empty());
    assert!(manager.claimed_resources().is_empty());

    let controller = ctx.controller.clone();
    let mut killed = 0;
    for _ in 0..100 {
        killed = controller.killed().await.len();
        if killed == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(killed, 2);

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_undeployable_role_aborts_creation() {
    let pinned = task("pinned").with_constraints(Constraints::new(vec![Constraint::equals(
        MACHINE_ID_ATTRIBUTE,
        "flp999",
    )]));
    let ctx = TestContext::builder()
        .workflow("pinned", Role::aggregator("root", vec![task("readout"), pinned]))
        .start()
        .await;
    let manager = ctx.manager().clone();

    let err = manager
        .create_environment("pinned", BTreeMap::new(), false)
        .await
        .unwrap_err();

    assert!(matches!(err.root(), Error::Coordination(_)));
    assert!(
        err.to_string().contains(
            "workflow deployment failed (one or more roles undeployable), aborting and cleaning up [undeployable roles: root.pinned]"
        ),
        "{err}"
    );
    assert!(manager.ids().is_empty());

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_deployment_times_out_without_offers() {
    let ctx = TestContext::builder()
        .workflow("readout", workflow())
        .without_offers()
        .config(|c| c.deployment_timeout = Duration::from_millis(200))
        .start()
        .await;
    let manager = ctx.manager().clone();

    let err = manager
        .create_environment("readout", BTreeMap::new(), false)
        .await
        .unwrap_err();

    assert!(matches!(err.root(), Error::Timeout(_)));
    let message = err.to_string();
    assert!(message.contains("workflow deployment timed out"), "{message}");
    assert!(
        message.contains("0 undeployable roles: ; 2 inactive roles: root.processor, root.readout"),
        "{message}"
    );
    assert!(manager.ids().is_empty());

    ctx.shutdown().await;
}
