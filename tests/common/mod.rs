#![allow(dead_code)]

use reviewflow::{
    bootstrap,
    runtime::{audit::SqliteAuditLog, ReviewService},
    workflow::{
        AttributeMap, BaseContext, Conclusion, ReviewTask, StepDefinition, StepRegistry,
        WorkflowId, WorkflowStorage, WorkflowType, WorkflowTypeRegistry,
    },
};
use serde_json::Value;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::sync::Arc;

pub const CREATOR: &str = "carol";

/// Single-connection in-memory database; the connection must never be recycled
pub async fn memory_pool() -> SqlitePool {
    SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap()
}

/// A step seeded from `data.reviewers.<key>`
pub fn step(key: &str, pass_rate: u32) -> StepDefinition {
    StepDefinition::new(key)
        .with_pass_rate(pass_rate)
        .with_assignees_from(&format!("reviewers.{}", key))
}

/// Workflow type whose steps all read their reviewers from the instance data
pub fn review_type(name: &str, steps: Vec<StepDefinition>) -> WorkflowType {
    let mut attributes = AttributeMap::new();
    let mut registry = StepRegistry::builder();
    for step in steps {
        attributes = attributes.with_data_path(format!("reviewers.{}", step.key()));
        registry = registry.step(step);
    }
    WorkflowType::new(name, registry.build().unwrap()).with_attributes(attributes)
}

pub struct Harness {
    pub pool: SqlitePool,
    pub service: ReviewService,
    pub audit: SqliteAuditLog,
}

pub async fn harness(types: Vec<WorkflowType>) -> Harness {
    bootstrap::init_tracing();
    let pool = memory_pool().await;
    let storage = WorkflowStorage::new(pool.clone());

    let mut builder = WorkflowTypeRegistry::builder();
    for workflow_type in types {
        builder = builder.register(workflow_type);
    }
    let registry = builder.build();
    bootstrap::init_schema(&storage, &registry).await.unwrap();

    let audit = SqliteAuditLog::new(pool.clone(), "op_log").unwrap();
    audit.init_schema().await.unwrap();

    let service = ReviewService::new(storage, Arc::new(registry)).with_audit(Arc::new(audit.clone()));
    Harness {
        pool,
        service,
        audit,
    }
}

pub fn ctx() -> BaseContext {
    BaseContext::default()
}

impl Harness {
    /// Create an instance as `CREATOR` and enter its first step
    pub async fn started(&self, workflow_type: &str, data: Value) -> WorkflowId {
        let instance = self
            .service
            .create_instance(workflow_type, CREATOR, data)
            .await
            .unwrap();
        self.service
            .start(workflow_type, instance.id, CREATOR, &ctx())
            .await
            .unwrap();
        instance.id
    }

    pub async fn tasks(&self, workflow_type: &str, id: WorkflowId) -> Vec<ReviewTask> {
        self.service
            .task_history(workflow_type, id, 0, 100)
            .await
            .unwrap()
    }

    pub async fn tasks_at(&self, workflow_type: &str, id: WorkflowId, step: &str) -> Vec<ReviewTask> {
        self.tasks(workflow_type, id)
            .await
            .into_iter()
            .filter(|t| t.step_key == step)
            .collect()
    }

    /// The open task of `assignee` at `step`
    pub async fn open_task(
        &self,
        workflow_type: &str,
        id: WorkflowId,
        step: &str,
        assignee: &str,
    ) -> ReviewTask {
        self.tasks_at(workflow_type, id, step)
            .await
            .into_iter()
            .find(|t| t.assignee == assignee && t.conclusion == Conclusion::Pending)
            .unwrap_or_else(|| panic!("no open task for {} at {}", assignee, step))
    }

    pub async fn current_step(&self, workflow_type: &str, id: WorkflowId) -> String {
        self.service
            .get_instance(workflow_type, id)
            .await
            .unwrap()
            .unwrap()
            .current_step
    }
}
