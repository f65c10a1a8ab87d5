//! Tasklane auditor entry point.

use std::process::ExitCode;
use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tasklane_auditor::config::{AuditorConfig, load_registry};
use tasklane_auditor::error::AppError;
use tasklane_auditor::runner::Auditor;
use tasklane_consistency::{ConsistencyEngine, OperationContext};
use tasklane_store::PgDatabase;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.is_cancelled() => {
            tracing::info!("audit cancelled");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "auditor failed");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), AppError> {
    let config = AuditorConfig::from_env()?;
    let registry = load_registry(config.schema_path.as_deref())?;

    tracing::info!(
        max_connections = config.max_connections,
        isolation_level = %config.policy.isolation_level,
        interval_secs = config.interval.map(|d| d.as_secs()),
        "starting Tasklane auditor"
    );
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await?;
    let database = PgDatabase::new(pool);
    if config.run_migrations {
        database.migrate().await?;
        tracing::info!("migrations applied");
    }

    let engine = ConsistencyEngine::builder(Arc::new(database), Arc::new(registry))
        .policy(config.policy.clone())
        .build();
    let auditor = Auditor::new(engine, config.policy, config.interval);

    let (cx, cancel) = OperationContext::cancellable();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let mut stdout = std::io::stdout();
    auditor.run(&cx, &mut stdout).await?;
    Ok(())
}
