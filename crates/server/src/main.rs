use std::{path::PathBuf, sync::Arc};

use db::{DBService, models::system_config::SystemConfig};
use services::services::{
    config::load_config_from_file, executor::ConversationExecutor, scheduler::Scheduler,
};
use sqlx::Error as SqlxError;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, prelude::*};
use utils::log_stream::LogBroadcaster;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Sqlx(#[from] SqlxError),
}

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let filter_string = format!(
        "warn,server={level},services={level},db={level},utils={level}",
        level = log_level
    );
    let fmt_filter = EnvFilter::try_new(&filter_string).expect("Failed to create tracing filter");
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(fmt_filter))
        .init();

    let config_path = std::env::var("XSHA_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.json"));
    let config = Arc::new(load_config_from_file(&config_path).await);
    if config.aes_key.is_empty() {
        tracing::warn!("aes_key is not configured; stored credential secrets will not decrypt");
    }

    let db = DBService::new(&config.database_path).await?;
    SystemConfig::initialize_defaults(&db.pool).await?;

    let broadcaster = Arc::new(LogBroadcaster::new());
    let executor = Arc::new(ConversationExecutor::new(
        db.clone(),
        Arc::clone(&config),
        Arc::clone(&broadcaster),
    ));

    // Conversations left in `running` by a previous process have no worker.
    match executor.recover_orphaned_conversations().await {
        Ok(0) => {}
        Ok(count) => tracing::warn!("Marked {count} orphaned conversations as failed"),
        Err(e) => tracing::error!("Failed to recover orphaned conversations: {e}"),
    }

    let shutdown = CancellationToken::new();
    let scheduler = Scheduler::new(db.clone(), Arc::clone(&executor), config.scheduler_interval());
    let scheduler_handle = scheduler.spawn(shutdown.clone());

    tracing::info!(
        "Execution engine running (workspaces in {}, cap {})",
        config.workspace_base_dir,
        config.max_concurrent_tasks
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received, stopping scheduler");
    shutdown.cancel();
    if let Err(e) = scheduler_handle.await {
        tracing::error!("Scheduler task panicked: {e}");
    }

    Ok(())
}
