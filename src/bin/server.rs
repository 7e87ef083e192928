//! Orchestration core server binary (`SPEC_FULL.md` §6.1).
//!
//! Binds `Config`, runs startup recovery, starts the retention scheduler,
//! and serves the HTTP API until `SIGINT`/`SIGTERM`. Exit codes: `0` clean
//! shutdown, `1` startup failure, `2` migration failure (`postgres` feature).

use agentgraph::orchestrator::config::Config;
use agentgraph::orchestrator::event_bus::EventBus;
use agentgraph::orchestrator::http::{self, AppState};
use agentgraph::orchestrator::manager::ExecutionManager;
use agentgraph::orchestrator::registry::{InMemoryModelRegistry, InMemoryToolRegistry, ModelRegistry, ToolRegistry};
use agentgraph::orchestrator::repository::{ExecutionLogRepository, ExecutionRepository, InMemoryRepository, TeamRepository};
use agentgraph::orchestrator::retention;
use std::process::ExitCode;
use std::sync::Arc;

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::from_env();
    config.init_logging();

    match run(config).await {
        Ok(()) => {
            log::info!("shut down cleanly");
            ExitCode::from(0)
        }
        Err(ServerError::Startup(msg)) => {
            log::error!("startup failed: {}", msg);
            ExitCode::from(1)
        }
        Err(ServerError::Migration(msg)) => {
            log::error!("migration failed: {}", msg);
            ExitCode::from(2)
        }
    }
}

enum ServerError {
    Startup(String),
    Migration(String),
}

async fn run(config: Config) -> Result<(), ServerError> {
    let (teams, executions, logs): (
        Arc<dyn TeamRepository>,
        Arc<dyn ExecutionRepository>,
        Arc<dyn ExecutionLogRepository>,
    ) = build_repositories(&config).await?;

    // No concrete model/tool providers ship in this crate (`spec.md` §1
    // "out of scope") — an embedding deployment registers its own before
    // traffic is expected to succeed; an empty registry still serves team
    // CRUD and validation correctly, just rejects triggers with VALIDATION_ERROR.
    let models: Arc<dyn ModelRegistry> = Arc::new(InMemoryModelRegistry::new());
    let tools: Arc<dyn ToolRegistry> = Arc::new(InMemoryToolRegistry::new());

    let event_bus = EventBus::new(logs.clone(), config.heartbeat_interval);
    let manager = Arc::new(ExecutionManager::new(
        teams.clone(),
        executions.clone(),
        event_bus.clone(),
        models.clone(),
        tools.clone(),
        config.max_concurrent_executions,
        config.default_execution_timeout,
    ));

    log::info!("running startup recovery sweep");
    manager.recover().await;

    let scheduler = retention::start(executions.clone(), config.retention_days, retention::DEFAULT_RETENTION_CRON)
        .await
        .map_err(|e| ServerError::Startup(format!("failed to start retention scheduler: {}", e)))?;

    let state = AppState { manager, teams, logs, event_bus, models, tools };
    let router = http::router(state);

    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| ServerError::Startup(format!("failed to bind {}: {}", bind_addr, e)))?;
    log::info!("listening on {}", bind_addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| ServerError::Startup(format!("server error: {}", e)))?;

    drop(scheduler);
    Ok(())
}

#[cfg(feature = "postgres")]
async fn build_repositories(
    config: &Config,
) -> Result<
    (Arc<dyn TeamRepository>, Arc<dyn ExecutionRepository>, Arc<dyn ExecutionLogRepository>),
    ServerError,
> {
    use agentgraph::orchestrator::postgres::PostgresRepository;

    let database_url = config
        .database_url
        .as_ref()
        .ok_or_else(|| ServerError::Startup("DATABASE_URL is required when built with the postgres feature".to_string()))?;
    let repo = Arc::new(
        PostgresRepository::connect(database_url)
            .await
            .map_err(|e| ServerError::Migration(e.to_string()))?,
    );
    Ok((repo.clone(), repo.clone(), repo))
}

#[cfg(not(feature = "postgres"))]
async fn build_repositories(
    _config: &Config,
) -> Result<
    (Arc<dyn TeamRepository>, Arc<dyn ExecutionRepository>, Arc<dyn ExecutionLogRepository>),
    ServerError,
> {
    let repo = InMemoryRepository::new();
    Ok((repo.clone(), repo.clone(), repo))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received");
}
