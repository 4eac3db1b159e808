//! End-to-end execution tests.
//!
//! These tests drive the orchestrator through the gated backend and check
//! the terminal classification, failure propagation and signal handling.

use std::sync::Arc;
use std::time::Duration;

use constellation::config::Config;
use constellation::core::{Condition, DependencyEdge, GraphState, TaskGraph, TaskId, TaskStatus};
use constellation::orchestration::{
    DeadlineBackend, GraphEvent, LocalBackend, Orchestrator, TaskOutcome,
};

use crate::fixtures::{
    chain_graph, diamond_graph, independent_graph, report_status, test_task, GatedBackend,
    RunHarness,
};

/// Test: Partial failure
/// Given A -> B (success only) and A -> C (unconditional)
/// When A fails and C succeeds
/// Then B is cancelled, C runs, and the graph is partially failed
#[tokio::test]
async fn test_partial_failure_scenario() {
    let mut graph = TaskGraph::new();
    for name in ["A", "B", "C"] {
        graph.add_task(test_task(name)).unwrap();
    }
    graph
        .add_dependency(DependencyEdge::success_only("A", "B"))
        .unwrap();
    graph
        .add_dependency(DependencyEdge::unconditional("A", "C"))
        .unwrap();

    let mut harness = RunHarness::start(graph);
    assert_eq!(harness.next_dispatched().await, TaskId::from("A"));
    assert!(harness.backend.fail("A", "device crashed"));

    assert_eq!(harness.next_dispatched().await, TaskId::from("C"));
    assert_eq!(harness.status_of("B").await, TaskStatus::Cancelled);
    assert_eq!(harness.status_of("C").await, TaskStatus::Running);
    assert!(harness.backend.complete("C"));

    let report = harness.finish().await;
    assert_eq!(report.state, GraphState::PartiallyFailed);
    assert_eq!(report_status(&report, "A"), TaskStatus::Failed);
    assert_eq!(report_status(&report, "B"), TaskStatus::Cancelled);
    assert_eq!(report_status(&report, "C"), TaskStatus::Completed);
    assert_eq!(
        report.failure(&TaskId::from("A")).unwrap().error,
        "device crashed"
    );
    assert!(report
        .failure(&TaskId::from("B"))
        .unwrap()
        .error
        .contains("A"));
}

/// Test: Independent tasks in any arrival order
/// Given three tasks without edges
/// When they complete in every possible order
/// Then all three are dispatched together and the graph completes only
/// after the last one reports
#[tokio::test]
async fn test_independent_tasks_any_arrival_order() {
    let orders = [
        [0, 1, 2],
        [0, 2, 1],
        [1, 0, 2],
        [1, 2, 0],
        [2, 0, 1],
        [2, 1, 0],
    ];
    for order in orders {
        let mut harness = RunHarness::start(independent_graph(3));
        let dispatched = harness.dispatched_batch(3).await;
        assert_eq!(
            dispatched,
            vec![TaskId::from("t0"), TaskId::from("t1"), TaskId::from("t2")],
            "dispatch follows insertion order"
        );

        for (step, index) in order.iter().enumerate() {
            let id = format!("t{}", index);
            assert!(harness.backend.complete(&id));
            harness.wait_for_status(&id, TaskStatus::Completed).await;
            if step < 2 {
                assert_eq!(harness.graph.read().await.state(), GraphState::Executing);
            }
        }

        let backend = harness.backend.clone();
        let report = harness.finish().await;
        assert_eq!(report.state, GraphState::Completed, "order {:?}", order);
        assert_eq!(backend.peak_concurrency(), 3);
    }
}

/// Test: Diamond respects dependencies
#[tokio::test]
async fn test_diamond_execution() {
    let mut harness = RunHarness::start(diamond_graph());
    assert_eq!(harness.next_dispatched().await, TaskId::from("a"));
    harness.backend.complete("a");

    let middle = harness.dispatched_batch(2).await;
    assert_eq!(middle, vec![TaskId::from("b"), TaskId::from("c")]);
    assert_eq!(harness.status_of("d").await, TaskStatus::WaitingDependency);

    harness.backend.complete("c");
    harness.wait_for_status("c", TaskStatus::Completed).await;
    assert_eq!(harness.status_of("d").await, TaskStatus::WaitingDependency);
    harness.backend.complete("b");

    assert_eq!(harness.next_dispatched().await, TaskId::from("d"));
    harness.backend.complete("d");

    let report = harness.finish().await;
    assert!(report.is_success());
    assert_eq!(report.metrics.critical_path.len(), 3);
}

/// Test: Capacity
/// Given six independent tasks and max_concurrent = 2
/// Then never more than two run at once
#[tokio::test]
async fn test_capacity_is_respected() {
    let config = Config {
        max_concurrent: 2,
        ..Config::default()
    };
    let mut harness = RunHarness::start_with(independent_graph(6), &config);

    for _ in 0..3 {
        let batch = harness.dispatched_batch(2).await;
        for id in &batch {
            assert!(harness.backend.complete(id.as_str()));
        }
    }

    let backend = harness.backend.clone();
    let report = harness.finish().await;
    assert!(report.is_success());
    assert_eq!(backend.peak_concurrency(), 2);
}

/// Test: Duplicate completion signals are dropped
#[tokio::test]
async fn test_duplicate_signal_is_noop() {
    let mut harness = RunHarness::start(chain_graph(2));
    assert_eq!(harness.next_dispatched().await, TaskId::from("t0"));

    let outcome = TaskOutcome::completed(serde_json::json!({"value": 1}));
    harness
        .handle
        .signal(TaskId::from("t0"), outcome.clone())
        .await
        .unwrap();
    harness.wait_for_status("t0", TaskStatus::Completed).await;
    harness
        .handle
        .signal(TaskId::from("t0"), TaskOutcome::failed("late"))
        .await
        .unwrap();
    // The gated dispatch for t0 resolves too; it is also a duplicate.
    harness.backend.complete("t0");

    assert_eq!(harness.next_dispatched().await, TaskId::from("t1"));
    {
        let graph = harness.graph.read().await;
        let t0 = graph.get_task(&TaskId::from("t0")).unwrap();
        assert_eq!(t0.status, TaskStatus::Completed);
        assert_eq!(t0.result, Some(serde_json::json!({"value": 1})));
        assert!(t0.error.is_none());
    }
    harness.backend.complete("t1");

    let report = harness.finish().await;
    assert!(report.is_success());
}

/// Test: Cancellation
/// Given a running chain
/// When the handle cancels
/// Then every non-terminal task is cancelled and in-flight work abandoned
#[tokio::test]
async fn test_cancellation_abandons_in_flight() {
    let mut harness = RunHarness::start(diamond_graph());
    harness.next_dispatched().await;
    harness.backend.complete("a");
    harness.dispatched_batch(2).await;

    harness.handle.cancel();
    let backend = harness.backend.clone();
    let report = harness.finish().await;

    assert!(report.cancelled);
    assert_eq!(report.state, GraphState::PartiallyFailed);
    assert_eq!(report_status(&report, "a"), TaskStatus::Completed);
    for id in ["b", "c", "d"] {
        assert_eq!(report_status(&report, id), TaskStatus::Cancelled);
    }
    let mut abandoned = backend.abandoned();
    abandoned.sort();
    assert_eq!(abandoned, vec![TaskId::from("b"), TaskId::from("c")]);
}

/// Test: Conditional edges route on results
#[tokio::test]
async fn test_conditional_routing() {
    let mut graph = TaskGraph::new();
    for name in ["check", "on_yes", "on_no"] {
        graph.add_task(test_task(name)).unwrap();
    }
    graph
        .add_dependency(DependencyEdge::conditional(
            "check",
            "on_yes",
            Condition::result_equals(serde_json::json!({"task": "check"})),
        ))
        .unwrap();
    graph
        .add_dependency(DependencyEdge::conditional(
            "check",
            "on_no",
            Condition::failed(),
        ))
        .unwrap();

    let mut harness = RunHarness::start(graph);
    harness.next_dispatched().await;
    harness.backend.complete("check");
    assert_eq!(harness.next_dispatched().await, TaskId::from("on_yes"));
    harness.backend.complete("on_yes");

    let report = harness.finish().await;
    assert_eq!(report.state, GraphState::PartiallyFailed);
    assert_eq!(report_status(&report, "on_no"), TaskStatus::Cancelled);
}

/// Test: Pinned devices skip assignment
#[tokio::test]
async fn test_pinned_device_skips_assign() {
    let mut graph = TaskGraph::new();
    graph
        .add_task(test_task("pinned").target_device("phone-7"))
        .unwrap();
    graph.add_task(test_task("free")).unwrap();

    let mut harness = RunHarness::start(graph);
    harness.dispatched_batch(2).await;
    harness.backend.complete("pinned");
    harness.backend.complete("free");
    let backend = harness.backend.clone();
    let report = harness.finish().await;

    assert_eq!(backend.assigned(), vec![TaskId::from("free")]);
    let pinned = report
        .tasks
        .iter()
        .find(|t| t.task_id.as_str() == "pinned")
        .unwrap();
    assert_eq!(pinned.device.as_ref().map(|d| d.0.as_str()), Some("phone-7"));
}

/// Test: Deadline wrapper
/// Given a backend that never answers and a 50ms deadline
/// Then the task fails with a deadline error
#[tokio::test(start_paused = true)]
async fn test_deadline_produces_synthetic_failure() {
    let (gated, _dispatched) = GatedBackend::new();
    let backend = DeadlineBackend::new(gated.clone(), Duration::from_millis(50));
    let orchestrator = Orchestrator::new(
        independent_graph(1),
        Arc::new(backend),
        &Config::default(),
    );
    let report = orchestrator.run().await.unwrap();

    assert_eq!(report.state, GraphState::Failed);
    let failure = report.failure(&TaskId::from("t0")).unwrap();
    assert!(failure.error.contains("deadline"), "{}", failure.error);
    assert_eq!(gated.abandoned(), vec![TaskId::from("t0")]);
}

/// Test: Live edits during execution
/// Given a running task
/// When a new dependent is added through the handle
/// Then it is dispatched once its dependency completes
#[tokio::test]
async fn test_live_edit_through_handle() {
    let mut harness = RunHarness::start(independent_graph(1));
    harness.next_dispatched().await;

    harness
        .handle
        .edit(|graph| {
            graph.add_task(test_task("follow_up"))?;
            graph.add_dependency(DependencyEdge::success_only("t0", "follow_up"))
        })
        .await
        .unwrap();
    assert_eq!(
        harness.status_of("follow_up").await,
        TaskStatus::WaitingDependency
    );

    harness.backend.complete("t0");
    assert_eq!(harness.next_dispatched().await, TaskId::from("follow_up"));
    harness.backend.complete("follow_up");

    let report = harness.finish().await;
    assert!(report.is_success());
    assert_eq!(report.tasks.len(), 2);
}

/// Test: Event stream
/// Every dispatched task is reported Running before its terminal status.
#[tokio::test]
async fn test_event_stream_orders_transitions() {
    let orchestrator = Orchestrator::new(
        chain_graph(3),
        Arc::new(LocalBackend::default()),
        &Config::default(),
    );
    let mut events = orchestrator.subscribe();
    let report = orchestrator.run().await.unwrap();
    assert!(report.is_success());

    let mut seen: Vec<(String, TaskStatus)> = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let GraphEvent::StatusChanged { task_id, new, .. } = event {
            seen.push((task_id.to_string(), new));
        }
    }
    for id in ["t0", "t1", "t2"] {
        let running = seen
            .iter()
            .position(|(t, s)| t == id && *s == TaskStatus::Running)
            .unwrap();
        let completed = seen
            .iter()
            .position(|(t, s)| t == id && *s == TaskStatus::Completed)
            .unwrap();
        assert!(running < completed);
    }
}
