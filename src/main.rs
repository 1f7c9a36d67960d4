use std::sync::Arc;

use task_orchestrator::config::{OrchestratorConfig, sqlite_target};
use task_orchestrator::orchestrator::{ProcessorRegistry, TaskOrchestrator};
use task_orchestrator::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = OrchestratorConfig::from_env()?;

    eprintln!("Task Orchestrator v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.database_url);
    eprintln!("   Jobs: {}", config.jobs_database_url());
    eprintln!("   Queue: {}", config.notifications_path().display());

    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::open(&sqlite_target(&config.database_url)?).await?);
    let orchestrator = TaskOrchestrator::open(&config, db, ProcessorRegistry::default()).await?;
    orchestrator.start().await;

    tracing::info!("Running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    orchestrator.stop().await;
    tracing::info!("Shut down cleanly");
    Ok(())
}
