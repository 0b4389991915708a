/// SQLite persistence layer for workflow instances
///
/// Handles instance CRUD in the main SQLite database. The business payload is
/// stored as JSON while the columns the engine filters on (type, step, status,
/// creator) stay indexed. Mutating calls take a connection so they can run
/// inside the caller's transaction.

use crate::error::{FlowError, FlowResult};
use crate::workflow::types::{
    FlowStatus, NewWorkflowInstance, WorkflowId, WorkflowInstance, NOT_STARTED,
};
use chrono::Utc;
use serde_json::Value;
use sqlx::{
    sqlite::{SqlitePool, SqliteRow},
    Row, SqliteConnection,
};

/// Largest page returned by listing calls
pub const MAX_PAGE_SIZE: i64 = 100;

/// SQLite-based workflow instance storage
#[derive(Debug, Clone)]
pub struct WorkflowStorage {
    /// SQLite connection pool for the workflow database
    pool: SqlitePool,
}

impl WorkflowStorage {
    /// Create new storage instance with database connection
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Initialize the instance schema
    ///
    /// Safe to call multiple times (uses IF NOT EXISTS).
    pub async fn init_schema(&self) -> FlowResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_instances (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                workflow_type TEXT NOT NULL,
                cur_step TEXT NOT NULL DEFAULT '',
                state INTEGER NOT NULL,
                creator TEXT NOT NULL,
                data TEXT NOT NULL,
                created_at TIMESTAMP NOT NULL,
                updated_at TIMESTAMP NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_workflow_instances_type_state
            ON workflow_instances(workflow_type, state)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_workflow_instances_creator ON workflow_instances(creator)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert a new instance positioned before its first step
    pub async fn insert(
        &self,
        conn: &mut SqliteConnection,
        new: &NewWorkflowInstance,
    ) -> FlowResult<WorkflowInstance> {
        let now = Utc::now();
        let data_json = serde_json::to_string(&new.data)?;

        let result = sqlx::query(
            r#"
            INSERT INTO workflow_instances
                (workflow_type, cur_step, state, creator, data, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&new.workflow_type)
        .bind(NOT_STARTED)
        .bind(new.status.code())
        .bind(&new.creator)
        .bind(&data_json)
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        Ok(WorkflowInstance {
            id: result.last_insert_rowid(),
            workflow_type: new.workflow_type.clone(),
            current_step: NOT_STARTED.to_string(),
            status: new.status,
            creator: new.creator.clone(),
            data: new.data.clone(),
            created_at: now,
            updated_at: now,
        })
    }

    /// Load an instance inside a transaction
    pub async fn fetch(
        &self,
        conn: &mut SqliteConnection,
        workflow_type: &str,
        id: WorkflowId,
    ) -> FlowResult<WorkflowInstance> {
        let row = sqlx::query(
            r#"
            SELECT id, workflow_type, cur_step, state, creator, data, created_at, updated_at
            FROM workflow_instances WHERE id = ? AND workflow_type = ?
            "#,
        )
        .bind(id)
        .bind(workflow_type)
        .fetch_optional(&mut *conn)
        .await?;

        match row {
            Some(row) => instance_from_row(&row),
            None => Err(FlowError::not_found(
                "workflow instance",
                format!("{}#{}", workflow_type, id),
            )),
        }
    }

    /// Retrieve an instance by ID outside of any transaction
    pub async fn get_instance(
        &self,
        workflow_type: &str,
        id: WorkflowId,
    ) -> FlowResult<Option<WorkflowInstance>> {
        let mut conn = self.pool.acquire().await?;
        match self.fetch(&mut conn, workflow_type, id).await {
            Ok(instance) => Ok(Some(instance)),
            Err(FlowError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// List instances of a type, newest first
    ///
    /// `limit` is clamped to `1..=MAX_PAGE_SIZE`.
    pub async fn list_instances(
        &self,
        workflow_type: &str,
        status: Option<FlowStatus>,
        offset: i64,
        limit: i64,
    ) -> FlowResult<Vec<WorkflowInstance>> {
        let limit = if (1..=MAX_PAGE_SIZE).contains(&limit) {
            limit
        } else {
            MAX_PAGE_SIZE
        };

        let rows = sqlx::query(
            r#"
            SELECT id, workflow_type, cur_step, state, creator, data, created_at, updated_at
            FROM workflow_instances
            WHERE workflow_type = ? AND (? IS NULL OR state = ?)
            ORDER BY id DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(workflow_type)
        .bind(status.map(FlowStatus::code))
        .bind(status.map(FlowStatus::code))
        .bind(limit)
        .bind(offset.max(0))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(instance_from_row).collect()
    }

    /// Move an instance to `new_step` with `status`
    ///
    /// The update only applies while the row is still at `expected_step`; a
    /// concurrent transition that already moved it yields `Conflict`.
    pub async fn update_position(
        &self,
        conn: &mut SqliteConnection,
        id: WorkflowId,
        expected_step: &str,
        new_step: &str,
        status: FlowStatus,
    ) -> FlowResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_instances
            SET cur_step = ?, state = ?, updated_at = ?
            WHERE id = ? AND cur_step = ?
            "#,
        )
        .bind(new_step)
        .bind(status.code())
        .bind(Utc::now())
        .bind(id)
        .bind(expected_step)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 {
            tracing::error!(
                "Workflow {} is no longer at step '{}', refusing to move it to '{}'",
                id,
                expected_step,
                new_step
            );
            return Err(FlowError::Conflict { workflow_id: id });
        }
        Ok(())
    }

    /// Set the status without moving the instance (e.g. TimedOut from a scheduler)
    pub async fn update_status(
        &self,
        conn: &mut SqliteConnection,
        id: WorkflowId,
        status: FlowStatus,
    ) -> FlowResult<()> {
        let result = sqlx::query("UPDATE workflow_instances SET state = ?, updated_at = ? WHERE id = ?")
            .bind(status.code())
            .bind(Utc::now())
            .bind(id)
            .execute(&mut *conn)
            .await?;
        if result.rows_affected() == 0 {
            return Err(FlowError::not_found("workflow instance", id));
        }
        Ok(())
    }

    /// Replace the business payload of an instance
    pub async fn update_data(
        &self,
        conn: &mut SqliteConnection,
        id: WorkflowId,
        data: &Value,
    ) -> FlowResult<()> {
        let data_json = serde_json::to_string(data)?;
        let result = sqlx::query("UPDATE workflow_instances SET data = ?, updated_at = ? WHERE id = ?")
            .bind(&data_json)
            .bind(Utc::now())
            .bind(id)
            .execute(&mut *conn)
            .await?;
        if result.rows_affected() == 0 {
            return Err(FlowError::not_found("workflow instance", id));
        }
        Ok(())
    }
}

fn instance_from_row(row: &SqliteRow) -> FlowResult<WorkflowInstance> {
    let data_json: String = row.try_get("data")?;
    Ok(WorkflowInstance {
        id: row.try_get("id")?,
        workflow_type: row.try_get("workflow_type")?,
        current_step: row.try_get("cur_step")?,
        status: FlowStatus::from_code(row.try_get("state")?)?,
        creator: row.try_get("creator")?,
        data: serde_json::from_str(&data_json)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
