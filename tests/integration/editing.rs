//! Editing and persistence tests.
//!
//! These tests exercise the undo/redo editor against whole-graph
//! snapshots and round-trip plans through files on disk.

use tempfile::TempDir;

use constellation::config::Config;
use constellation::core::{
    DependencyEdge, GraphSnapshot, GraphState, TaskGraph, TaskId, TaskStatus, TaskUpdate,
};
use constellation::editor::{EditCommand, GraphEditor};
use constellation::orchestration::{LocalBackend, Orchestrator};
use constellation::Error;

use crate::fixtures::{diamond_graph, test_task, RunHarness};

fn ids(snapshot: &GraphSnapshot) -> (Vec<String>, Vec<String>) {
    let nodes = snapshot.nodes.iter().map(|n| n.id.to_string()).collect();
    let mut edges: Vec<String> = snapshot
        .edges
        .iter()
        .filter_map(|e| e.id.as_ref().map(|id| id.to_string()))
        .collect();
    edges.sort();
    (nodes, edges)
}

/// Test: Undo restores the exact node and edge set
#[test]
fn test_undo_redo_id_for_id() {
    let mut graph = diamond_graph();
    let mut editor = GraphEditor::new();
    let before = graph.snapshot();

    editor
        .execute(&mut graph, EditCommand::add_task(test_task("e")))
        .unwrap();
    editor
        .execute(
            &mut graph,
            EditCommand::add_dependency(DependencyEdge::success_only("d", "e").with_id("d-e")),
        )
        .unwrap();
    let after = graph.snapshot();

    assert!(editor.undo(&mut graph).unwrap());
    assert!(editor.undo(&mut graph).unwrap());
    assert!(!editor.undo(&mut graph).unwrap());
    assert_eq!(ids(&graph.snapshot()), ids(&before));
    assert_eq!(graph.snapshot().nodes, before.nodes);

    assert!(editor.redo(&mut graph).unwrap());
    assert!(editor.redo(&mut graph).unwrap());
    assert_eq!(ids(&graph.snapshot()), ids(&after));
    assert_eq!(graph.snapshot().nodes, after.nodes);
}

/// Test: Editing a live plan
/// Edits through the editor apply to not-yet-started tasks only, and the
/// orchestrator picks up the result.
#[tokio::test]
async fn test_editor_on_running_graph() {
    let mut harness = RunHarness::start(diamond_graph());
    harness.next_dispatched().await;

    let mut editor = GraphEditor::new();
    let rejected = harness
        .handle
        .edit(|graph| {
            editor.execute(
                graph,
                EditCommand::update_task("a", TaskUpdate::description("too late")),
            )
        })
        .await;
    assert!(matches!(rejected, Err(Error::ImmutableState { .. })));

    harness
        .handle
        .edit(|graph| {
            editor.execute(
                graph,
                EditCommand::batch(vec![
                    EditCommand::update_task("d", TaskUpdate::description("merge results")),
                    EditCommand::add_task(test_task("report")),
                    EditCommand::add_dependency(DependencyEdge::unconditional("d", "report")),
                ]),
            )
        })
        .await
        .unwrap();
    assert_eq!(
        harness.status_of("report").await,
        TaskStatus::WaitingDependency
    );

    for id in ["a", "b", "c", "d"] {
        harness.backend.complete(id);
        if id == "a" {
            harness.dispatched_batch(2).await;
        } else if id == "c" {
            assert_eq!(harness.next_dispatched().await, TaskId::from("d"));
        }
    }
    assert_eq!(harness.next_dispatched().await, TaskId::from("report"));
    harness.backend.complete("report");

    let report = harness.finish().await;
    assert!(report.is_success());
    assert_eq!(report.tasks.len(), 5);
}

/// Test: Planner output round-trips through disk and executes
#[tokio::test]
async fn test_snapshot_file_roundtrip_and_run() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("plan.json");
    std::fs::write(
        &path,
        r#"{
            "nodes": [
                {"id": "open", "description": "Open the settings app"},
                {"id": "wifi", "description": "Toggle wifi", "dependencies": ["open"],
                 "tips": ["the switch is near the top"]},
                {"id": "verify", "description": "Check the status bar"}
            ],
            "edges": [
                {"id": "check", "from": "wifi", "to": "verify", "condition_kind": "conditional",
                 "condition_expr": {"op": "succeeded"}}
            ]
        }"#,
    )
    .unwrap();

    let graph = TaskGraph::from_snapshot(GraphSnapshot::load(&path).unwrap()).unwrap();
    assert_eq!(
        graph.get_topological_order().unwrap(),
        vec![
            TaskId::from("open"),
            TaskId::from("wifi"),
            TaskId::from("verify")
        ]
    );

    let report = Orchestrator::new(
        graph,
        std::sync::Arc::new(LocalBackend::new(2)),
        &Config::default(),
    )
    .run()
    .await
    .unwrap();
    assert_eq!(report.state, GraphState::Completed);

    let saved = dir.path().join("saved.json");
    let rebuilt = TaskGraph::from_snapshot(GraphSnapshot::load(&path).unwrap()).unwrap();
    rebuilt.snapshot().save(&saved).unwrap();
    let reloaded = TaskGraph::from_snapshot(GraphSnapshot::load(&saved).unwrap()).unwrap();
    assert_eq!(reloaded.task_count(), 3);
    assert_eq!(reloaded.edge_count(), 2);
}

/// Test: Malformed planner output is rejected before anything runs
#[test]
fn test_untrusted_snapshot_rejected() {
    let cases = [
        (r#"{"nodes": [{"id": "a"}, {"id": "a"}]}"#, "duplicate"),
        (r#"{"nodes": [{"id": "a", "dependencies": ["a"]}]}"#, "self"),
        (
            r#"{"nodes": [{"id": "a"}], "edges": [{"from": "a", "to": "b"}]}"#,
            "unknown",
        ),
        (
            r#"{"nodes": [{"id": "a"}, {"id": "b"}],
                "edges": [{"from": "a", "to": "b", "condition_kind": "conditional"}]}"#,
            "conditional",
        ),
    ];
    for (json, label) in cases {
        let snapshot = GraphSnapshot::from_json(json).unwrap();
        let result = TaskGraph::from_snapshot(snapshot);
        let ok = match label {
            "duplicate" => matches!(result, Err(Error::DuplicateId(_))),
            "self" => matches!(result, Err(Error::SelfLoop(_))),
            "unknown" => matches!(result, Err(Error::UnknownNode(_))),
            _ => matches!(result, Err(Error::Validation(_))),
        };
        assert!(ok, "{} case: {:?}", label, result.err());
    }
}
