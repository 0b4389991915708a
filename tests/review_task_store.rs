mod common;

use common::memory_pool;
use proptest::prelude::*;
use reviewflow::{
    workflow::{
        Conclusion, FlowStatus, NewReviewTask, NewWorkflowInstance, ReviewTaskStore, TaskKind,
        WorkflowStorage,
    },
    ErrorKind, FlowError,
};
use serde_json::json;
use sqlx::SqlitePool;

const FLOW: &str = "purchase";

async fn store_with_pool() -> (ReviewTaskStore, SqlitePool) {
    let pool = memory_pool().await;
    let store = ReviewTaskStore::new(TaskKind::default());
    let mut conn = pool.acquire().await.unwrap();
    store.init_schema(&mut conn).await.unwrap();
    drop(conn);
    (store, pool)
}

fn new_task(assignee: &str, step: &str) -> NewReviewTask {
    NewReviewTask {
        assignee: assignee.to_string(),
        step_key: step.to_string(),
        workflow_id: 1,
        workflow_type: FLOW.to_string(),
    }
}

#[tokio::test]
async fn create_and_load_for_step() {
    let (store, pool) = store_with_pool().await;
    let mut conn = pool.acquire().await.unwrap();

    let created = store
        .create(&mut conn, &[new_task("alice", "A"), new_task("bob", "A"), new_task("dave", "B")])
        .await
        .unwrap();
    assert_eq!(created.len(), 3);
    assert!(created.iter().all(|t| t.conclusion == Conclusion::Pending));

    let a = store.load_for_step(&mut conn, FLOW, 1, "A").await.unwrap();
    assert_eq!(a.len(), 2);
    assert_eq!(a[0].assignee, "alice");

    let err = store.load_for_step(&mut conn, FLOW, 1, "C").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    let err = store.load_for_step(&mut conn, FLOW, 2, "A").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[tokio::test]
async fn failed_batch_leaves_nothing_behind() {
    let (store, pool) = store_with_pool().await;
    let mut tx = pool.begin().await.unwrap();
    let err = store
        .create(&mut tx, &[new_task("alice", "A"), new_task("alice", "A")])
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::Database(_)));
    tx.rollback().await.unwrap();

    let mut conn = pool.acquire().await.unwrap();
    assert!(store.history(&mut conn, FLOW, 1).await.unwrap().is_empty());
}

#[tokio::test]
async fn clear_without_preserve_removes_every_listed_step() {
    let (store, pool) = store_with_pool().await;
    let mut conn = pool.acquire().await.unwrap();
    store
        .create(&mut conn, &[new_task("alice", "A"), new_task("bob", "B"), new_task("dave", "C")])
        .await
        .unwrap();

    let removed = store.clear(&mut conn, FLOW, 1, &["B", "A"], &[]).await.unwrap();
    assert_eq!(removed, 2);
    let left = store.history(&mut conn, FLOW, 1).await.unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].step_key, "C");

    assert_eq!(store.clear(&mut conn, FLOW, 1, &[], &[]).await.unwrap(), 0);
}

#[tokio::test]
async fn clear_with_preserve_only_touches_the_first_step() {
    let (store, pool) = store_with_pool().await;
    let mut conn = pool.acquire().await.unwrap();
    let created = store
        .create(
            &mut conn,
            &[
                new_task("alice", "A"),
                new_task("dave", "A"),
                new_task("bob", "B"),
                new_task("erin", "B"),
            ],
        )
        .await
        .unwrap();
    let bob = created[2].id;

    let removed = store
        .clear(&mut conn, FLOW, 1, &["B", "A"], &[bob])
        .await
        .unwrap();
    assert_eq!(removed, 1);

    let left: Vec<String> = store
        .history(&mut conn, FLOW, 1)
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.assignee)
        .collect();
    assert_eq!(left, vec!["alice", "dave", "bob"]);
}

#[tokio::test]
async fn decisions_are_recorded_once() {
    let (store, pool) = store_with_pool().await;
    let mut conn = pool.acquire().await.unwrap();
    let created = store.create(&mut conn, &[new_task("alice", "A")]).await.unwrap();
    let id = created[0].id;

    store
        .record_conclusion(&mut conn, id, Conclusion::ApprovedWithRisk, "minor issues")
        .await
        .unwrap();
    let task = store.get(&mut conn, id).await.unwrap();
    assert!(task.is_finished());
    assert!(task.is_approved());
    assert_eq!(task.remark, "minor issues");

    let err = store
        .record_conclusion(&mut conn, id, Conclusion::Rejected, "changed my mind")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(store.find_open(&mut conn, FLOW, 1, "A", "alice").await.unwrap().is_none());

    assert_eq!(store.reopen(&mut conn, &[id]).await.unwrap(), 1);
    let reopened = store.find_open(&mut conn, FLOW, 1, "A", "alice").await.unwrap().unwrap();
    assert_eq!(reopened.id, id);
    assert_eq!(reopened.remark, "");

    let err = store.get(&mut conn, 999).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn instance_position_updates_guard_against_lost_updates() {
    let pool = memory_pool().await;
    let storage = WorkflowStorage::new(pool.clone());
    storage.init_schema().await.unwrap();
    let mut conn = pool.acquire().await.unwrap();

    let instance = storage
        .insert(
            &mut conn,
            &NewWorkflowInstance {
                workflow_type: FLOW.to_string(),
                creator: "carol".to_string(),
                status: FlowStatus::Running,
                data: json!({"amount": 3}),
            },
        )
        .await
        .unwrap();
    storage
        .update_position(&mut conn, instance.id, "", "A", FlowStatus::Running)
        .await
        .unwrap();

    let err = storage
        .update_position(&mut conn, instance.id, "", "B", FlowStatus::Running)
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::Conflict { .. }));

    let loaded = storage.fetch(&mut conn, FLOW, instance.id).await.unwrap();
    assert_eq!(loaded.current_step, "A");
    assert_eq!(loaded.data, json!({"amount": 3}));

    let err = storage.fetch(&mut conn, "leave", instance.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn preserved_tasks_survive_any_clear(
        steps in proptest::collection::vec(prop_oneof![Just("A"), Just("B"), Just("C")], 1..8),
        keep in proptest::collection::vec(any::<bool>(), 8),
        cleared in proptest::collection::vec(prop_oneof![Just("A"), Just("B"), Just("C")], 1..3),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        runtime.block_on(async {
            let (store, pool) = store_with_pool().await;
            let mut conn = pool.acquire().await.unwrap();
            let tasks: Vec<NewReviewTask> = steps
                .iter()
                .enumerate()
                .map(|(i, step)| new_task(&format!("user{}", i), step))
                .collect();
            let created = store.create(&mut conn, &tasks).await.unwrap();
            let preserved: Vec<i64> = created
                .iter()
                .zip(&keep)
                .filter(|(_, keep)| **keep)
                .map(|(t, _)| t.id)
                .collect();

            store.clear(&mut conn, FLOW, 1, &cleared, &preserved).await.unwrap();
            let left: Vec<i64> = store
                .history(&mut conn, FLOW, 1)
                .await
                .unwrap()
                .into_iter()
                .map(|t| t.id)
                .collect();
            for id in &preserved {
                assert!(left.contains(id), "preserved task {} was deleted", id);
            }
        });
    }
}
