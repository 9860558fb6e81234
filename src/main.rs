use clap::{Parser, Subcommand};
use pg_orchestrator::config::Config;
use pg_orchestrator::repository::{
    BackupRepository, ConnectionRepository, DatabaseConfigRepository, establish_connection,
};
use pg_orchestrator::services::{
    BackupScheduler, BackupService, ConnectionManager, DatabaseRegistry, UploadStreams,
};
use pg_orchestrator::storage::{Fs2DiskSpace, LocalStore};
use pg_orchestrator::worker::process::run_worker;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "pg_orchestrator", version, about = "PostgreSQL backups and script workers")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the orchestrator until interrupted (default)
    Serve,
    /// Forked worker process, speaks JSON lines on stdin/stdout
    Worker,
}

fn init_tracing(worker: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "pg_orchestrator=debug".into());
    if worker {
        // stdout carries the protocol
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn run_server<F>(shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let config = Config::from_env()?;
    tracing::info!("Starting pg_orchestrator with config: {:?}", config);

    if let Some(path) = config.database_url.strip_prefix("sqlite:") {
        let path = std::path::Path::new(path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::create_dir_all(&config.backup_dir)?;

    let db_pool = establish_connection(&config.database_url).await?;
    tracing::info!("Database connected: {}", config.database_url);

    // Repositories
    let connections = ConnectionRepository::new(db_pool.clone());
    let configs = DatabaseConfigRepository::new(db_pool.clone());
    let backups = BackupRepository::new(db_pool);

    // Services
    let registry = DatabaseRegistry::new();
    let backup_service = BackupService::new(
        backups.clone(),
        connections.clone(),
        LocalStore::new(&config.backup_dir),
        Arc::new(registry.clone()),
        Arc::new(Fs2DiskSpace),
        config.pg_bin_dir.clone(),
        config.backup.clone(),
    );
    let scheduler = BackupScheduler::new(backup_service, configs.clone(), &config.backup);
    let manager = ConnectionManager::new(
        connections.clone(),
        configs,
        backups,
        registry,
        scheduler.waker(),
        config.worker.clone(),
    );
    let uploads = UploadStreams::new(config.backup.upload_idle_timeout());

    let cancel = CancellationToken::new();
    let scheduler_task = tokio::spawn(scheduler.run(cancel.clone()));
    let uploads_task = tokio::spawn(uploads.run_gc(cancel.clone()));

    for connection in connections.list().await? {
        if let Err(err) = manager.start_connection(&connection.id).await {
            tracing::error!("Failed to start connection {}: {}", connection.id, err);
        }
    }

    shutdown.await;
    tracing::info!("Shutting down");
    cancel.cancel();
    manager.shutdown().await;
    let _ = scheduler_task.await;
    let _ = uploads_task.await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            init_tracing(false);
            run_server(async {
                if let Err(err) = tokio::signal::ctrl_c().await {
                    tracing::error!("Failed to listen for shutdown signal: {}", err);
                }
            })
            .await
        }
        Command::Worker => {
            init_tracing(true);
            run_worker().await
        }
    }
}
