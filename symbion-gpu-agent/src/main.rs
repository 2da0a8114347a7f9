//! Symbion GPU Agent entry point
//!
//! Startup order: config -> tool preflight -> instance identity -> collection
//! loop. Startup failures exit with a code identifying the failure kind:
//! 1 tool missing, 2 tool error, 3 no GPUs, 4 metadata server, 5 configuration.

use symbion_gpu_agent::collector::{CollectionLoop, LoopStats};
use symbion_gpu_agent::config::AgentConfig;
use symbion_gpu_agent::error::FatalError;
use symbion_gpu_agent::metadata::MetadataClient;
use symbion_gpu_agent::preflight::StartupValidator;
use symbion_gpu_agent::probe::NvidiaSmi;
use symbion_gpu_agent::publish::{CloudMonitoringClient, PublishBatcher};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    dotenvy::dotenv().ok(); // Ok si .env n'existe pas

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("symbion_gpu_agent=info")),
        )
        .init();

    info!("🖥️ Symbion GPU Agent v{} starting...", env!("CARGO_PKG_VERSION"));

    match run().await {
        Ok(stats) => {
            info!(
                "Agent stopped after {} cycles ({} failed)",
                stats.completed + stats.failed,
                stats.failed
            );
        }
        Err(e) => {
            error!("{}", e);
            std::process::exit(e.exit_code());
        }
    }
}

async fn run() -> Result<LoopStats, FatalError> {
    let config = AgentConfig::load()
        .await
        .map_err(|e| FatalError::Config(format!("{e:#}")))?;
    let catalog = config.validate()?;

    StartupValidator::new(&config.tool.binary, config.probe_timeout())
        .validate()
        .await?;

    let metadata = MetadataClient::new(&config.metadata.base_url, config.metadata_timeout())?;
    let identity = metadata.resolve_identity().await?;

    let backend = CloudMonitoringClient::new(
        &config.monitoring.endpoint,
        &config.monitoring.resource_type,
        config.monitoring_timeout(),
        metadata,
    )
    .map_err(|e| FatalError::Config(format!("cannot build monitoring HTTP client: {e}")))?;

    let mut collector = CollectionLoop::new(
        NvidiaSmi::new(&config.tool.binary, config.probe_timeout()),
        PublishBatcher::new(backend, config.monitoring.metric_prefix.as_str()),
        catalog,
        identity,
        config.interval(),
    );

    Ok(collector.run_until(shutdown_signal()).await)
}

/// Resolves on Ctrl-C, or SIGTERM on Unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
