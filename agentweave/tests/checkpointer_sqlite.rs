//! SQLite checkpointer: durable roundtrips behind the `sqlite` feature.

#![cfg(feature = "sqlite")]

use chrono::Utc;
use serde_json::json;

use agentweave::event_bus::Event;
use agentweave::runtime::{
    Checkpoint, Checkpointer, CheckpointerError, FrontierEntry, JoinLedger, SqliteCheckpointer,
    StepRecord,
};
use agentweave::state::{StateDelta, WorkflowState};
use agentweave::types::NodeRef;

async fn connect() -> (SqliteCheckpointer, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!(
        "sqlite://{}?mode=rwc",
        dir.path().join("agentweave-test.db").display()
    );
    let cp = SqliteCheckpointer::connect(Some(&url)).await.unwrap();
    (cp, dir)
}

fn checkpoint(thread: &str, step: u64) -> Checkpoint {
    let mut state = WorkflowState::builder()
        .with_property("items", json!([1, 2]))
        .build();
    state.set_step(step);
    let mut ledger = JoinLedger::new();
    ledger.record_completion("j", "a", StateDelta::of("items", json!([1])));
    Checkpoint::new(
        thread,
        state,
        vec![FrontierEntry::plain(NodeRef::node("j"))],
        ledger,
    )
}

#[tokio::test]
async fn save_and_load_roundtrip() {
    let (cp, _dir) = connect().await;
    cp.save(checkpoint("t1", 1)).await.unwrap();
    cp.save(checkpoint("t1", 2)).await.unwrap();

    let latest = cp.load_latest("t1").await.unwrap().unwrap();
    assert_eq!(latest.step_index, 2);
    assert_eq!(latest.state.get("items"), Some(&json!([1, 2])));
    assert_eq!(latest.frontier, vec![FrontierEntry::plain(NodeRef::node("j"))]);
    assert!(latest.join_ledger.entry("j").is_some());

    assert!(cp.load_latest("unknown").await.unwrap().is_none());
}

#[tokio::test]
async fn stale_writes_are_rejected() {
    let (cp, _dir) = connect().await;
    cp.save(checkpoint("t1", 3)).await.unwrap();
    let err = cp.save(checkpoint("t1", 3)).await.unwrap_err();
    assert!(matches!(err, CheckpointerError::StaleWrite { .. }));
}

#[tokio::test]
async fn threads_are_isolated() {
    let (cp, _dir) = connect().await;
    cp.save(checkpoint("alpha", 1)).await.unwrap();
    cp.save(checkpoint("beta", 5)).await.unwrap();

    assert_eq!(cp.list_threads().await.unwrap(), vec!["alpha", "beta"]);
    cp.delete_thread("alpha").await.unwrap();
    assert!(cp.load_latest("alpha").await.unwrap().is_none());
    assert_eq!(cp.load_latest("beta").await.unwrap().unwrap().step_index, 5);
}

#[tokio::test]
async fn step_history_roundtrips_with_events() {
    let (cp, _dir) = connect().await;
    for (i, node) in ["plan", "apply"].iter().enumerate() {
        cp.append_step(StepRecord {
            execution_id: "exec_1".into(),
            step_index: i as u64 + 1,
            node_id: node.to_string(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            input_snapshot: json!({"seen": i}),
            output_delta: json!({node.to_string(): "done"}),
            events: vec![Event::NodeComplete {
                node_id: node.to_string(),
                step_index: i as u64 + 1,
                delta_digest: "00".into(),
            }],
            error: if i == 1 { Some("boom".into()) } else { None },
        })
        .await
        .unwrap();
    }

    let steps = cp.steps("exec_1").await.unwrap();
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0].node_id, "plan");
    assert_eq!(steps[0].input_snapshot, json!({"seen": 0}));
    assert_eq!(steps[1].error.as_deref(), Some("boom"));
    assert!(matches!(steps[0].events[0], Event::NodeComplete { .. }));

    assert!(cp.steps("exec_unknown").await.unwrap().is_empty());
}
