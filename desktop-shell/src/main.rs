use std::sync::Arc;

use anyhow::Context;
use shared_types::{launch, Endpoint, Envelope, MessageKind, UserSelection, STATUS_USER_SELECTION};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use desktop_shell::config::Config;
use desktop_shell::notifications::{Notifier, TracingNotifier};
use desktop_shell::prompt::{SelectAll, SelectionPrompt, TerminalPrompt};
use desktop_shell::{BusClient, ClientEvent};

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "desktop_shell=debug,modkeeper_desktop=debug".into()),
        )
        .with(fmt::layer())
        .init();

    launch::require_supervised()?;
    let port = launch::port_from_args(std::env::args()).context("reading rendezvous port")?;
    let config = Config::from_env()?;

    let prompt: Arc<dyn SelectionPrompt> = if config.interactive {
        Arc::new(TerminalPrompt)
    } else {
        Arc::new(SelectAll)
    };
    let notifier: Arc<dyn Notifier> = Arc::new(TracingNotifier);

    let (events_tx, mut events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let client = BusClient::new(config, events_tx, Arc::clone(&notifier));
    let cancel = CancellationToken::new();
    let bus_task = tokio::spawn(client.clone().run(port, cancel.clone()));

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("Termination signal received");
                break;
            }
            event = events.recv() => match event {
                Some(event) => handle_event(&client, &prompt, notifier.as_ref(), event),
                None => break,
            }
        }
    }

    cancel.cancel();
    let _ = bus_task.await;
    Ok(())
}

fn handle_event(
    client: &BusClient,
    prompt: &Arc<dyn SelectionPrompt>,
    notifier: &dyn Notifier,
    event: ClientEvent,
) {
    match event {
        ClientEvent::SelectFiles { task_id, request } => {
            // Prompts can take minutes; keep draining events meanwhile.
            let client = client.clone();
            let prompt = Arc::clone(prompt);
            tokio::spawn(async move {
                let files = prompt.choose(&request).await;
                tracing::info!(
                    %task_id,
                    selected = files.len(),
                    offered = request.files.len(),
                    "Selection made"
                );
                let reply = match Envelope::new(MessageKind::Status, STATUS_USER_SELECTION)
                    .with_task_id(task_id.as_str())
                    .with_payload(&UserSelection { files })
                {
                    Ok(reply) => reply,
                    Err(e) => {
                        tracing::error!(%task_id, error = %e, "Failed to encode selection");
                        return;
                    }
                };
                if let Err(e) = client.send_message(reply, Endpoint::Install).await {
                    tracing::warn!(%task_id, error = %e, "Selection not delivered");
                }
            });
        }
        ClientEvent::ConfigChanged(update) => {
            tracing::info!(key = %update.key, value = %update.value, "Setting changed");
        }
        ClientEvent::Error(envelope) => {
            notifier.error(&envelope.message);
        }
        ClientEvent::Status { endpoint, envelope } => {
            let title = envelope.title.as_deref().unwrap_or(envelope.status.as_str());
            match envelope.progress {
                Some(progress) => {
                    tracing::info!(%endpoint, progress, "{title}: {}", envelope.message)
                }
                None if endpoint == Endpoint::Notifications => {
                    notifier.notify(title, &envelope.message)
                }
                None => tracing::info!(%endpoint, "{title}: {}", envelope.message),
            }
        }
    }
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
