use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use launcher::config::Config;
use launcher::supervisor::{pick_rendezvous_port, BinaryLauncher, Supervisor};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "launcher=debug,modkeeper=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let port = pick_rendezvous_port().context("reserving rendezvous port")?;
    info!(
        port,
        worker = %config.worker_binary.display(),
        ui = %config.ui_binary.display(),
        "launcher starting"
    );

    let launcher = Arc::new(BinaryLauncher::new(
        config.worker_binary.clone(),
        config.ui_binary.clone(),
    ));
    let supervisor = Supervisor::new(config.supervisor.clone(), launcher, port);
    supervisor.start().await?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Ctrl-C received"),
                Err(e) => {
                    warn!("failed to listen for Ctrl-C: {e}");
                    return;
                }
            }
            cancel.cancel();
        });
    }

    let reason = Arc::clone(&supervisor).run(cancel).await;
    for child in supervisor.snapshot().await {
        info!(
            role = %child.role,
            pid = ?child.pid,
            status = ?child.status,
            restarts = child.restarts,
            uptime_secs = child.uptime.as_secs(),
            "final child state"
        );
    }
    info!(%reason, "launcher stopped");
    Ok(())
}
