use color_eyre::eyre;
use faas_runtime::builtin::builtin_catalog;
use faas_runtime::logging::init_tracing;
use faas_runtime::{EnvOverrides, Runtime, RuntimeConfig};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;

    let overrides = EnvOverrides::from_env();
    let config = RuntimeConfig::load(&overrides)?;
    init_tracing(&config.logger.level);

    info!(name = %config.name, address = %config.server.address, "Starting function runtime...");

    let runtime = Runtime::load(config, &builtin_catalog())?;
    runtime.serve(shutdown_signal()).await?;

    info!("Function runtime stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
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
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
