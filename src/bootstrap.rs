/// Service setup and initialization
///
/// Wires together all components: connection pool, schema, registry, audit
/// sink, attachment store and the review service.

use crate::{
    config::Config,
    error::FlowResult,
    runtime::{
        attachments::LocalAttachmentStore,
        audit::SqliteAuditLog,
        review::ReviewService,
    },
    workflow::{
        registry::WorkflowTypeRegistry,
        step::TaskKind,
        storage::WorkflowStorage,
        tasks::ReviewTaskStore,
    },
};
use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::{str::FromStr, sync::Arc};
use tracing_subscriber::EnvFilter;

/// Install the fmt subscriber with an `EnvFilter` (`RUST_LOG`, default `info`)
///
/// Later calls are no-ops, so tests may call it freely.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .try_init();
}

/// Open the connection pool, creating the database file and its directory if needed
pub async fn connect(config: &Config) -> Result<SqlitePool> {
    let url = &config.database.url;
    let options = SqliteConnectOptions::from_str(url)
        .with_context(|| format!("Invalid database url '{}'", url))?
        .create_if_missing(true);

    let db_path = options.get_filename();
    if let Some(dir) = db_path.parent().filter(|d| !d.as_os_str().is_empty()) {
        tracing::info!("📁 Ensuring database directory exists: {}", dir.display());
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create database directory '{}'", dir.display()))?;
    }

    tracing::info!("🗄️ Connecting to {}", url);
    SqlitePoolOptions::new()
        .max_connections(config.database.max_connections.max(1))
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to connect to '{}'", url))
}

/// Create the instance table, every task table used by the registry, and the
/// default task table
pub async fn init_schema(storage: &WorkflowStorage, registry: &WorkflowTypeRegistry) -> FlowResult<()> {
    storage.init_schema().await?;

    let mut kinds = registry.task_kinds();
    if !kinds.contains(&TaskKind::default()) {
        kinds.push(TaskKind::default());
    }
    let mut conn = storage.pool().acquire().await?;
    for kind in kinds {
        tracing::debug!("Preparing task table '{}'", kind.table());
        ReviewTaskStore::new(kind).init_schema(&mut *conn).await?;
    }
    Ok(())
}

/// Build a ready-to-use review service from configuration
pub async fn build_service(config: &Config, registry: WorkflowTypeRegistry) -> Result<ReviewService> {
    let pool = connect(config).await?;
    let storage = WorkflowStorage::new(pool.clone());

    tracing::info!("📋 Initializing schema for {} workflow types", registry.len());
    init_schema(&storage, &registry)
        .await
        .context("Failed to initialize workflow schema")?;

    let audit = SqliteAuditLog::new(pool, config.review.audit_table.clone())?;
    audit
        .init_schema()
        .await
        .context("Failed to initialize audit table")?;

    let mut service = ReviewService::new(storage, Arc::new(registry))
        .with_audit(Arc::new(audit))
        .require_login(config.review.require_login);

    if let Some(dir) = &config.review.attachment_dir {
        tracing::info!("📎 Storing attachments under {}", dir.display());
        service = service.with_attachments(Arc::new(LocalAttachmentStore::new(dir.clone())));
    }

    tracing::info!("✅ Review service initialized");
    Ok(service)
}
