/// Operation audit log
///
/// Successful operations emit an `AuditRecord`. Recording is best effort: the
/// service logs a failed write and carries on, it never fails the operation.

use crate::error::{validate_identifier, FlowResult};
use crate::workflow::types::WorkflowId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{sqlite::SqlitePool, Row};

/// Default audit table name
pub const DEFAULT_AUDIT_TABLE: &str = "op_log";

/// One audited action on a workflow instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRecord {
    /// Acting user
    pub user: String,
    pub workflow_type: String,
    pub workflow_id: WorkflowId,
    /// e.g. "create", "start", or the key of the step acted on
    pub action: String,
    pub remark: String,
}

/// Destination of audit records
///
/// Errors are logged by the caller and never fail the audited operation.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: AuditRecord) -> anyhow::Result<()>;
}

/// Audit sink that only emits a tracing event
#[derive(Debug, Default, Clone)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, record: AuditRecord) -> anyhow::Result<()> {
        tracing::info!(
            user = %record.user,
            workflow_type = %record.workflow_type,
            workflow_id = record.workflow_id,
            action = %record.action,
            "📝 {}",
            record.remark
        );
        Ok(())
    }
}

/// Persisted audit entry, as returned by `SqliteAuditLog::history`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    /// Row id, increasing in write order
    pub id: i64,
    /// Acting user
    pub user: String,
    /// "create", "start", or the key of the step acted on
    pub action: String,
    pub workflow_id: WorkflowId,
    pub workflow_type: String,
    /// Conclusion code and remark, or the text returned by a hook
    pub remark: String,
    pub created_at: DateTime<Utc>,
}

/// Audit sink writing to a SQLite table
#[derive(Debug, Clone)]
pub struct SqliteAuditLog {
    pool: SqlitePool,
    table: String,
}

impl SqliteAuditLog {
    pub fn new(pool: SqlitePool, table: impl Into<String>) -> FlowResult<Self> {
        let table = table.into();
        validate_identifier(&table)?;
        Ok(Self { pool, table })
    }

    pub async fn init_schema(&self) -> FlowResult<()> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user TEXT NOT NULL,
                action TEXT NOT NULL,
                workflow_id INTEGER NOT NULL,
                workflow_type TEXT NOT NULL,
                remark TEXT NOT NULL,
                created_at TIMESTAMP NOT NULL
            )
            "#,
            table = self.table
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_workflow ON {table}(workflow_type, workflow_id)",
            table = self.table
        ))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Audit entries of one instance, oldest first
    pub async fn history(
        &self,
        workflow_type: &str,
        workflow_id: WorkflowId,
        offset: i64,
        limit: Option<i64>,
    ) -> FlowResult<Vec<AuditEntry>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT id, user, action, workflow_id, workflow_type, remark, created_at
            FROM {} WHERE workflow_type = ? AND workflow_id = ?
            ORDER BY id LIMIT ? OFFSET ?
            "#,
            self.table
        ))
        .bind(workflow_type)
        .bind(workflow_id)
        .bind(limit.unwrap_or(-1))
        .bind(offset.max(0))
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            entries.push(AuditEntry {
                id: row.try_get("id")?,
                user: row.try_get("user")?,
                action: row.try_get("action")?,
                workflow_id: row.try_get("workflow_id")?,
                workflow_type: row.try_get("workflow_type")?,
                remark: row.try_get("remark")?,
                created_at: row.try_get("created_at")?,
            });
        }
        Ok(entries)
    }
}

#[async_trait]
impl AuditSink for SqliteAuditLog {
    async fn record(&self, record: AuditRecord) -> anyhow::Result<()> {
        sqlx::query(&format!(
            r#"
            INSERT INTO {} (user, action, workflow_id, workflow_type, remark, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
            self.table
        ))
        .bind(&record.user)
        .bind(&record.action)
        .bind(record.workflow_id)
        .bind(&record.workflow_type)
        .bind(&record.remark)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
