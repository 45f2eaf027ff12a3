use anyhow::Context;
use shared_types::launch;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use worker::app_state::AppState;
use worker::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "worker=debug,modkeeper_worker=debug".into()),
        )
        .with(fmt::layer())
        .init();

    launch::require_supervised()?;
    let port = launch::port_from_args(std::env::args()).context("reading rendezvous port")?;
    let config = Config::from_env()?;

    let cancel = CancellationToken::new();
    let app = AppState::start(config, port, cancel.clone()).await?;

    tokio::spawn(watch_stdin(cancel.clone()));
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = shutdown_signal() => tracing::info!("Termination signal received"),
    }

    app.shutdown().await;
    Ok(())
}

/// The launcher writes `shutdown` on stdin; EOF means it went away.
async fn watch_stdin(cancel: CancellationToken) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim() == launch::SHUTDOWN_COMMAND => {
                tracing::info!("Shutdown requested by launcher");
                break;
            }
            Ok(Some(line)) => tracing::debug!(%line, "Ignoring stdin line"),
            Ok(None) => {
                tracing::info!("Launcher stdin closed");
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read stdin");
                break;
            }
        }
    }
    cancel.cancel();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
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
                tracing::warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
