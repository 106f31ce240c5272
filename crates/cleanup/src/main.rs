use anyhow::Context;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    jobsweep_observability::init();

    let config = jobsweep_cleanup::config::from_env()
        .context("failed to load cleanup configuration from the environment")?;

    let stats = jobsweep_cleanup::app::run(config, shutdown_signal()).await?;
    tracing::info!(
        acknowledged = stats.events_acknowledged,
        handled = stats.handled,
        permanent_failures = stats.permanent_failures,
        "cleanup exited"
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}
