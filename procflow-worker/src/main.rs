//! The polling worker: claims due work items from the shared store, drives
//! the LLM and agent handlers, sweeps stale leases, and shuts down cleanly
//! on SIGTERM/SIGINT.

mod reasoning;

use anyhow::Result;
use procflow_core::agent::{AgentDispatcher, HttpAgentChannel};
use procflow_core::config::EngineConfig;
use procflow_core::dispatcher::{Dispatcher, DispatcherConfig};
use procflow_core::handler::WorkItemHandler;
use procflow_core::mailer::{Mailer, SmtpMailer};
use procflow_core::resolver::NextStepResolver;
use procflow_core::script::{ProcessScriptRunner, ScriptRunner};
use procflow_core::store::ProcessStore;
use procflow_core::store_memory::MemoryStore;
use reasoning::HttpReasoner;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let config = EngineConfig::from_env()?;
    let store = build_store(&config).await?;

    let mailer: Option<Arc<dyn Mailer>> = match &config.smtp {
        Some(smtp) => Some(Arc::new(SmtpMailer::from_config(smtp)?)),
        None => {
            tracing::warn!("no SMTP configuration, external-customer mail disabled");
            None
        }
    };
    let script_runner: Arc<dyn ScriptRunner> =
        Arc::new(ProcessScriptRunner::new(config.script_interpreter.clone()));

    let reasoner = Arc::new(HttpReasoner::new(config.reasoning_service_url.clone()));
    let resolver = Arc::new(NextStepResolver::new(
        store.clone(),
        mailer,
        Some(script_runner),
    ));
    let handler = Arc::new(WorkItemHandler::new(
        store.clone(),
        reasoner.clone(),
        resolver,
    ));
    let agent = Arc::new(AgentDispatcher::new(
        store.clone(),
        reasoner.clone(),
        reasoner.clone(),
        Arc::new(HttpAgentChannel::new(config.execution_service_url.clone())),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatcher = Arc::new(Dispatcher::new(
        store,
        handler,
        agent,
        DispatcherConfig {
            consumer_id: config.consumer_id.clone(),
            poll_interval: config.poll_interval,
            cleanup_interval: config.cleanup_interval,
            stale_claim_age: config.stale_claim_age,
            claim_batch: config.claim_batch,
        },
        shutdown_rx,
    ));

    let polling = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.run().await })
    };
    let cleanup = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.run_cleanup().await })
    };

    wait_for_shutdown_signal().await?;
    tracing::info!("shutdown signal received, draining in-flight work");
    shutdown_tx.send(true)?;

    polling.await??;
    cleanup.await?;
    tracing::info!("worker stopped");
    Ok(())
}

async fn build_store(config: &EngineConfig) -> Result<Arc<dyn ProcessStore>> {
    #[cfg(feature = "postgres")]
    if let Some(database) = &config.database {
        tracing::info!(host = %database.host, ssl = %database.ssl_mode, "connecting to PostgreSQL");
        let pool = sqlx::postgres::PgPoolOptions::new()
            .acquire_timeout(std::time::Duration::from_secs(10))
            .connect(&database.connect_url())
            .await?;
        let store = procflow_core::store_postgres::PostgresProcessStore::new(pool);
        store.init_schema().await?;
        tracing::info!("using PostgresProcessStore (schema applied)");
        return Ok(Arc::new(store));
    }

    if config.database.is_some() {
        tracing::warn!("database configured but postgres support not compiled in");
    }
    tracing::warn!("no database configuration, using MemoryStore (state is not durable)");
    Ok(Arc::new(MemoryStore::new()))
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => tracing::warn!("SIGINT received"),
        _ = sigterm.recv() => tracing::warn!("SIGTERM received"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
