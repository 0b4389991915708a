/// Reviewflow: multi-step human approval workflow engine
///
/// Prepares the database for the review engine: connects with the configured
/// URL and creates the instance, default task and audit tables.

use reviewflow::{
    bootstrap::{connect, init_schema, init_tracing},
    config::Config,
    runtime::audit::SqliteAuditLog,
    workflow::{registry::WorkflowTypeRegistry, storage::WorkflowStorage},
};

/// Application entry point
///
/// Workflow types are registered by the embedding application, so only the
/// tables every deployment needs are created here.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    // Load configuration (defaults to data/reviewflow.db)
    let config = Config::default();
    tracing::info!("Preparing reviewflow database...");

    let pool = connect(&config).await?;
    let storage = WorkflowStorage::new(pool.clone());
    init_schema(&storage, &WorkflowTypeRegistry::builder().build()).await?;

    let audit = SqliteAuditLog::new(pool, config.review.audit_table.clone())?;
    audit.init_schema().await?;

    tracing::info!("✅ Database ready at {}", config.database.url);
    Ok(())
}
