/// SQLite persistence for reviewer tasks
///
/// One `ReviewTaskStore` serves one task table (a step's `TaskKind`). Every
/// call takes a connection; batch operations are only all-or-nothing when
/// that connection is inside the caller's transaction.

use crate::error::{FlowError, FlowResult};
use crate::workflow::{
    step::TaskKind,
    types::{Conclusion, NewReviewTask, ReviewTask, TaskId, WorkflowId},
};
use chrono::Utc;
use sqlx::{
    sqlite::{Sqlite, SqliteRow},
    QueryBuilder, Row, SqliteConnection,
};

const TASK_COLUMNS: &str =
    "id, assignee, step, workflow_id, workflow_type, conclusion, remark, created_at, updated_at";

/// Reviewer task access for one task table
#[derive(Debug, Clone)]
pub struct ReviewTaskStore {
    kind: TaskKind,
}

impl ReviewTaskStore {
    pub fn new(kind: TaskKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    fn table(&self) -> &str {
        self.kind.table()
    }

    /// Create the task table and its indexes (IF NOT EXISTS)
    pub async fn init_schema(&self, conn: &mut SqliteConnection) -> FlowResult<()> {
        let table = self.table();
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                assignee TEXT NOT NULL,
                step TEXT NOT NULL,
                workflow_id INTEGER NOT NULL,
                workflow_type TEXT NOT NULL,
                conclusion INTEGER NOT NULL DEFAULT 0,
                remark TEXT NOT NULL DEFAULT '',
                created_at TIMESTAMP NOT NULL,
                updated_at TIMESTAMP NOT NULL,
                UNIQUE (workflow_type, workflow_id, step, assignee)
            )
            "#
        ))
        .execute(&mut *conn)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_workflow ON {table}(workflow_type, workflow_id, step)"
        ))
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Insert a batch of tasks, stopping at the first failure
    pub async fn create(
        &self,
        conn: &mut SqliteConnection,
        tasks: &[NewReviewTask],
    ) -> FlowResult<Vec<ReviewTask>> {
        let now = Utc::now();
        let mut created = Vec::with_capacity(tasks.len());
        for task in tasks {
            let result = sqlx::query(&format!(
                r#"
                INSERT INTO {} (assignee, step, workflow_id, workflow_type, conclusion, remark, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, '', ?, ?)
                "#,
                self.table()
            ))
            .bind(&task.assignee)
            .bind(&task.step_key)
            .bind(task.workflow_id)
            .bind(&task.workflow_type)
            .bind(Conclusion::Pending.code())
            .bind(now)
            .bind(now)
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                tracing::error!(
                    "Failed to create review task for '{}' at step '{}' of workflow {}: {}",
                    task.assignee,
                    task.step_key,
                    task.workflow_id,
                    e
                );
                e
            })?;

            created.push(ReviewTask {
                id: result.last_insert_rowid(),
                assignee: task.assignee.clone(),
                step_key: task.step_key.clone(),
                workflow_id: task.workflow_id,
                workflow_type: task.workflow_type.clone(),
                conclusion: Conclusion::Pending,
                remark: String::new(),
                created_at: now,
                updated_at: now,
            });
        }
        tracing::debug!("Created {} review tasks in '{}'", created.len(), self.table());
        Ok(created)
    }

    /// Every task, open or closed, of one instance at one step
    ///
    /// A started instance always has tasks at its current step, so an empty
    /// result is reported as a configuration error.
    pub async fn load_for_step(
        &self,
        conn: &mut SqliteConnection,
        workflow_type: &str,
        workflow_id: WorkflowId,
        step_key: &str,
    ) -> FlowResult<Vec<ReviewTask>> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM {} WHERE workflow_type = ? AND workflow_id = ? AND step = ? ORDER BY id",
            self.table()
        ))
        .bind(workflow_type)
        .bind(workflow_id)
        .bind(step_key)
        .fetch_all(&mut *conn)
        .await?;

        if rows.is_empty() {
            return Err(FlowError::Configuration(format!(
                "no review tasks for step '{}' of workflow {} ({})",
                step_key, workflow_id, workflow_type
            )));
        }
        rows.iter().map(task_from_row).collect()
    }

    /// Delete the tasks of `step_keys` for one instance
    ///
    /// With an empty `preserve_ids` every task at any of `step_keys` goes.
    /// Otherwise only tasks at `step_keys[0]` are deleted, and never one whose
    /// id is in `preserve_ids`.
    pub async fn clear(
        &self,
        conn: &mut SqliteConnection,
        workflow_type: &str,
        workflow_id: WorkflowId,
        step_keys: &[&str],
        preserve_ids: &[TaskId],
    ) -> FlowResult<u64> {
        let Some(first_step) = step_keys.first() else {
            return Ok(0);
        };

        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("DELETE FROM {} WHERE workflow_type = ", self.table()));
        builder.push_bind(workflow_type);
        builder.push(" AND workflow_id = ");
        builder.push_bind(workflow_id);

        if preserve_ids.is_empty() {
            builder.push(" AND step IN (");
            let mut steps = builder.separated(", ");
            for step in step_keys {
                steps.push_bind(*step);
            }
            steps.push_unseparated(")");
        } else {
            builder.push(" AND step = ");
            builder.push_bind(*first_step);
            builder.push(" AND id NOT IN (");
            let mut ids = builder.separated(", ");
            for id in preserve_ids {
                ids.push_bind(*id);
            }
            ids.push_unseparated(")");
        }

        let result = builder.build().execute(&mut *conn).await.map_err(|e| {
            tracing::error!(
                "Failed to clear review tasks of workflow {} at {:?}: {}",
                workflow_id,
                step_keys,
                e
            );
            e
        })?;
        tracing::debug!(
            "Cleared {} review tasks of workflow {} at {:?} (preserved {:?})",
            result.rows_affected(),
            workflow_id,
            step_keys,
            preserve_ids
        );
        Ok(result.rows_affected())
    }

    /// Fetch specific tasks by id; missing ids are simply absent
    pub async fn load(&self, conn: &mut SqliteConnection, ids: &[TaskId]) -> FlowResult<Vec<ReviewTask>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {TASK_COLUMNS} FROM {} WHERE id IN (", self.table()));
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(") ORDER BY id");

        let rows = builder.build().fetch_all(&mut *conn).await?;
        rows.iter().map(task_from_row).collect()
    }

    pub async fn get(&self, conn: &mut SqliteConnection, id: TaskId) -> FlowResult<ReviewTask> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM {} WHERE id = ?", self.table()))
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
        match row {
            Some(row) => task_from_row(&row),
            None => Err(FlowError::not_found("review task", id)),
        }
    }

    /// The open task of `assignee` at a step, if any
    pub async fn find_open(
        &self,
        conn: &mut SqliteConnection,
        workflow_type: &str,
        workflow_id: WorkflowId,
        step_key: &str,
        assignee: &str,
    ) -> FlowResult<Option<ReviewTask>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {TASK_COLUMNS} FROM {}
            WHERE workflow_type = ? AND workflow_id = ? AND step = ? AND assignee = ? AND conclusion = ?
            "#,
            self.table()
        ))
        .bind(workflow_type)
        .bind(workflow_id)
        .bind(step_key)
        .bind(assignee)
        .bind(Conclusion::Pending.code())
        .fetch_optional(&mut *conn)
        .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    /// Store a decision on an open task
    ///
    /// Only pending tasks are updated, so a repeated submission cannot decide
    /// a task twice.
    pub async fn record_conclusion(
        &self,
        conn: &mut SqliteConnection,
        id: TaskId,
        conclusion: Conclusion,
        remark: &str,
    ) -> FlowResult<()> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET conclusion = ?, remark = ?, updated_at = ? WHERE id = ? AND conclusion = ?",
            self.table()
        ))
        .bind(conclusion.code())
        .bind(remark)
        .bind(Utc::now())
        .bind(id)
        .bind(Conclusion::Pending.code())
        .execute(&mut *conn)
        .await?;
        if result.rows_affected() == 0 {
            return Err(FlowError::Validation(format!(
                "review task {} is missing or already decided",
                id
            )));
        }
        Ok(())
    }

    /// Hand an open task to another reviewer
    pub async fn reassign(
        &self,
        conn: &mut SqliteConnection,
        id: TaskId,
        assignee: &str,
    ) -> FlowResult<()> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET assignee = ?, updated_at = ? WHERE id = ? AND conclusion = ?",
            self.table()
        ))
        .bind(assignee)
        .bind(Utc::now())
        .bind(id)
        .bind(Conclusion::Pending.code())
        .execute(&mut *conn)
        .await?;
        if result.rows_affected() == 0 {
            return Err(FlowError::Validation(format!(
                "review task {} is missing or already decided",
                id
            )));
        }
        Ok(())
    }

    /// Put decided tasks back to pending so their reviewers decide again
    pub async fn reopen(&self, conn: &mut SqliteConnection, ids: &[TaskId]) -> FlowResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("UPDATE {} SET conclusion = ", self.table()));
        builder.push_bind(Conclusion::Pending.code());
        builder.push(", remark = '', updated_at = ");
        builder.push_bind(Utc::now());
        builder.push(" WHERE id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        let result = builder.build().execute(&mut *conn).await?;
        Ok(result.rows_affected())
    }

    /// All tasks of an instance across steps, oldest first
    pub async fn history(
        &self,
        conn: &mut SqliteConnection,
        workflow_type: &str,
        workflow_id: WorkflowId,
    ) -> FlowResult<Vec<ReviewTask>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {TASK_COLUMNS} FROM {}
            WHERE workflow_type = ? AND workflow_id = ?
            ORDER BY id
            "#,
            self.table()
        ))
        .bind(workflow_type)
        .bind(workflow_id)
        .fetch_all(&mut *conn)
        .await?;
        rows.iter().map(task_from_row).collect()
    }

    /// Decided tasks of one step, e.g. to choose who re-reviews after a rollback
    pub async fn decided_for_step(
        &self,
        conn: &mut SqliteConnection,
        workflow_type: &str,
        workflow_id: WorkflowId,
        step_key: &str,
    ) -> FlowResult<Vec<ReviewTask>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {TASK_COLUMNS} FROM {}
            WHERE workflow_type = ? AND workflow_id = ? AND step = ? AND conclusion <> ?
            ORDER BY id
            "#,
            self.table()
        ))
        .bind(workflow_type)
        .bind(workflow_id)
        .bind(step_key)
        .bind(Conclusion::Pending.code())
        .fetch_all(&mut *conn)
        .await?;
        rows.iter().map(task_from_row).collect()
    }
}

fn task_from_row(row: &SqliteRow) -> FlowResult<ReviewTask> {
    Ok(ReviewTask {
        id: row.try_get("id")?,
        assignee: row.try_get("assignee")?,
        step_key: row.try_get("step")?,
        workflow_id: row.try_get("workflow_id")?,
        workflow_type: row.try_get("workflow_type")?,
        conclusion: Conclusion::try_from(row.try_get::<i64, _>("conclusion")?)?,
        remark: row.try_get("remark")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
