mod common;

use async_trait::async_trait;
use common::{ctx, harness, review_type, step};
use reviewflow::{
    runtime::{HookContext, LocalAttachmentStore, TransitionHook},
    workflow::{Attachment, Conclusion, Submission, WorkflowType},
    ErrorKind, FlowError,
};
use serde_json::json;
use std::sync::{Arc, Mutex};

const VENDOR: &str = "vendor";

fn data() -> serde_json::Value {
    json!({"reviewers": {"A": "alice", "B": "bob,dave"}})
}

fn vendor_type() -> WorkflowType {
    review_type(VENDOR, vec![step("A", 100), step("B", 100)])
}

/// Writes through the transaction, then fails
struct FailingHook;

#[async_trait]
impl TransitionHook for FailingHook {
    async fn run(&self, cx: HookContext<'_>) -> anyhow::Result<Option<String>> {
        sqlx::query("INSERT INTO scratch (note) VALUES (?)")
            .bind(cx.task.assignee.clone())
            .execute(cx.conn)
            .await?;
        anyhow::bail!("vendor is blacklisted")
    }
}

/// Moves the instance row behind the engine's back
struct MoveRowHook;

#[async_trait]
impl TransitionHook for MoveRowHook {
    async fn run(&self, cx: HookContext<'_>) -> anyhow::Result<Option<String>> {
        sqlx::query("UPDATE workflow_instances SET cur_step = 'Z' WHERE id = ?")
            .bind(cx.instance.id)
            .execute(cx.conn)
            .await?;
        Ok(None)
    }
}

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<Vec<String>>>,
}

#[async_trait]
impl TransitionHook for Recorder {
    async fn run(&self, cx: HookContext<'_>) -> anyhow::Result<Option<String>> {
        let assignees: Vec<String> = cx.current_tasks.iter().map(|t| t.assignee.clone()).collect();
        let remark = format!("{} decided, now waiting on {}", cx.actor, assignees.join(","));
        self.seen.lock().unwrap().push(assignees);
        Ok(Some(remark))
    }
}

async fn create_scratch(pool: &sqlx::SqlitePool) {
    sqlx::query("CREATE TABLE scratch (note TEXT NOT NULL)")
        .execute(pool)
        .await
        .unwrap();
}

#[tokio::test]
async fn failing_before_hook_rolls_back_everything() {
    let h = harness(vec![vendor_type().with_before_transition(Arc::new(FailingHook))]).await;
    create_scratch(&h.pool).await;
    let id = h.started(VENDOR, data()).await;
    let a = h.open_task(VENDOR, id, "A", "alice").await;

    let err = h
        .service
        .submit(VENDOR, id, a.id, "alice", Submission::approve("ok"), &ctx())
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::Hook(_)));
    assert_eq!(err.kind(), ErrorKind::Transition);

    let notes: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM scratch")
        .fetch_one(&h.pool)
        .await
        .unwrap();
    assert_eq!(notes, 0);
    assert_eq!(h.open_task(VENDOR, id, "A", "alice").await.remark, "");
    assert!(h.tasks_at(VENDOR, id, "B").await.is_empty());
    assert_eq!(h.current_step(VENDOR, id).await, "A");
}

#[tokio::test]
async fn before_hook_only_runs_for_approvals() {
    let h = harness(vec![vendor_type().with_before_transition(Arc::new(FailingHook))]).await;
    create_scratch(&h.pool).await;
    let id = h.started(VENDOR, data()).await;
    let a = h.open_task(VENDOR, id, "A", "alice").await;

    let outcome = h
        .service
        .submit(VENDOR, id, a.id, "alice", Submission::reject("no"), &ctx())
        .await
        .unwrap();
    assert_eq!(outcome.task.conclusion, Conclusion::Rejected);
    assert_eq!(outcome.instance.current_step, "");
}

#[tokio::test]
async fn after_hook_sees_new_tasks_and_sets_the_remark() {
    let recorder = Arc::new(Recorder::default());
    let h = harness(vec![vendor_type().with_after_transition(recorder.clone())]).await;
    let id = h.started(VENDOR, data()).await;
    let a = h.open_task(VENDOR, id, "A", "alice").await;

    let outcome = h
        .service
        .submit(VENDOR, id, a.id, "alice", Submission::approve(""), &ctx())
        .await
        .unwrap();
    assert_eq!(outcome.remark, "alice decided, now waiting on bob,dave");
    assert_eq!(
        recorder.seen.lock().unwrap().clone(),
        vec![vec!["bob".to_string(), "dave".to_string()]]
    );

    let audit = h.audit.history(VENDOR, id, 0, None).await.unwrap();
    assert_eq!(audit.last().unwrap().remark, outcome.remark);
}

#[tokio::test]
async fn concurrent_move_is_a_conflict() {
    let h = harness(vec![vendor_type().with_before_transition(Arc::new(MoveRowHook))]).await;
    let id = h.started(VENDOR, data()).await;
    let a = h.open_task(VENDOR, id, "A", "alice").await;

    let err = h
        .service
        .submit(VENDOR, id, a.id, "alice", Submission::approve(""), &ctx())
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::Conflict { workflow_id } if workflow_id == id));
    assert_eq!(h.current_step(VENDOR, id).await, "A");
    assert!(h.tasks_at(VENDOR, id, "B").await.is_empty());
}

fn quote() -> Attachment {
    Attachment {
        key: "quote".to_string(),
        filename: "quote.pdf".to_string(),
        content: b"%PDF-1.4".to_vec(),
    }
}

fn files_under(dir: &std::path::Path) -> usize {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries.count(),
        Err(_) => 0,
    }
}

#[tokio::test]
async fn attachments_are_kept_on_success() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(vec![vendor_type()]).await;
    let service = h
        .service
        .clone()
        .with_attachments(Arc::new(LocalAttachmentStore::new(dir.path())));
    let id = h.started(VENDOR, data()).await;
    let a = h.open_task(VENDOR, id, "A", "alice").await;

    let outcome = service
        .submit(VENDOR, id, a.id, "alice", Submission::approve("").with_attachment(quote()), &ctx())
        .await
        .unwrap();
    assert_eq!(outcome.attachments.len(), 1);
    assert_eq!(outcome.attachments[0].filename, "quote.pdf");
    assert_eq!(files_under(&dir.path().join(VENDOR).join(id.to_string())), 1);
}

#[tokio::test]
async fn attachments_are_removed_when_the_submission_fails() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(vec![vendor_type().with_before_transition(Arc::new(FailingHook))]).await;
    create_scratch(&h.pool).await;
    let service = h
        .service
        .clone()
        .with_attachments(Arc::new(LocalAttachmentStore::new(dir.path())));
    let id = h.started(VENDOR, data()).await;
    let a = h.open_task(VENDOR, id, "A", "alice").await;

    service
        .submit(VENDOR, id, a.id, "alice", Submission::approve("").with_attachment(quote()), &ctx())
        .await
        .unwrap_err();
    assert_eq!(files_under(&dir.path().join(VENDOR).join(id.to_string())), 0);
}

#[tokio::test]
async fn attachments_need_a_store() {
    let h = harness(vec![vendor_type()]).await;
    let id = h.started(VENDOR, data()).await;
    let a = h.open_task(VENDOR, id, "A", "alice").await;

    let err = h
        .service
        .submit(VENDOR, id, a.id, "alice", Submission::approve("").with_attachment(quote()), &ctx())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(!h.open_task(VENDOR, id, "A", "alice").await.is_finished());
}
