use std::{path::Path, sync::Arc};

use ember_agent::{AgentConfig, JavaRuntime, JsonProfileStore, ServerManager};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Stdout plus a daily-rolling file under `logs_dir`. The guard must live
/// until exit so buffered file output is flushed.
fn init_tracing(logs_dir: &Path) -> WorkerGuard {
    if let Err(err) = std::fs::create_dir_all(logs_dir) {
        eprintln!("failed to create log directory {}: {err}", logs_dir.display());
    }
    let file_appender = tracing_appender::rolling::daily(logs_dir, "ember-agent.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .init();
    guard
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AgentConfig::from_env();
    let _log_guard = init_tracing(&config.logs_dir());

    tracing::info!(
        data_root = %config.data_root.display(),
        version = env!("CARGO_PKG_VERSION"),
        "ember-agent starting"
    );

    let store = Arc::new(JsonProfileStore::from_config(&config));
    let runtime = Arc::new(JavaRuntime::new(&config)?);
    let manager = ServerManager::new(store, runtime.clone(), &config);

    let reset = manager.reconcile().await?;
    if reset > 0 {
        tracing::info!(reset, "reset stale server statuses");
    }

    let mut logs = manager.subscribe_logs();
    tokio::spawn(async move {
        while let Some(l) = logs.recv().await {
            tracing::info!(target: "ember_agent::server", profile_id = %l.profile_id, "{}", l.line);
        }
    });

    let mut progress = runtime.subscribe_progress();
    tokio::spawn(async move {
        while let Some(p) = progress.recv().await {
            tracing::debug!(
                phase = ?p.phase,
                percent = p.percent,
                downloaded = p.downloaded_bytes,
                total = p.total_bytes,
                "java runtime progress"
            );
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested; stopping servers");
    manager.stop_all().await;
    tracing::info!("ember-agent stopped");
    Ok(())
}
