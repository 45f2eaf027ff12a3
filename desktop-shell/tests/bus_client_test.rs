//! Bus client against a real worker bus server

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use shared_types::{
    Endpoint, Envelope, MessageKind, SelectFilesRequest, UserSelection, STATUS_SELECT_FILES,
    STATUS_USER_SELECTION,
};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use desktop_shell::config::Config;
use desktop_shell::notifications::Notifier;
use desktop_shell::{BusClient, ClientEvent, LinkState};
use worker::bus::{BusServer, InboundMessage};
use worker::settings::{Settings, SettingsStore};

#[derive(Default)]
struct CountingNotifier {
    lost: AtomicUsize,
    attempts: AtomicUsize,
    restored: AtomicUsize,
}

impl Notifier for CountingNotifier {
    fn connection_lost(&self) {
        self.lost.fetch_add(1, Ordering::SeqCst);
    }

    fn reconnect_attempt(&self, _attempt: u32) {
        self.attempts.fetch_add(1, Ordering::SeqCst);
    }

    fn connection_restored(&self) {
        self.restored.fetch_add(1, Ordering::SeqCst);
    }

    fn notify(&self, _title: &str, _message: &str) {}

    fn error(&self, _message: &str) {}
}

fn fast_config() -> Config {
    Config {
        interactive: false,
        healthy_interval: Duration::from_millis(20),
        retry_interval: Duration::from_millis(50),
    }
}

struct Worker {
    server: BusServer,
    port: u16,
    inbound: mpsc::Receiver<InboundMessage>,
    cancel: CancellationToken,
}

async fn start_worker(port: u16) -> Worker {
    let (tx, inbound) = mpsc::channel(16);
    let cancel = CancellationToken::new();
    let server = BusServer::new(
        SettingsStore::in_memory(Settings::default()),
        tx,
        cancel.clone(),
    );
    let addr = server.start(port).await.expect("Failed to start bus");
    Worker {
        server,
        port: addr.port(),
        inbound,
        cancel,
    }
}

/// Bind a fresh worker on `port` once the previous listener has let go of it.
async fn restart_worker(port: u16) -> Worker {
    timeout(Duration::from_secs(5), async {
        loop {
            let (tx, inbound) = mpsc::channel(16);
            let cancel = CancellationToken::new();
            let server = BusServer::new(
                SettingsStore::in_memory(Settings::default()),
                tx,
                cancel.clone(),
            );
            if let Ok(addr) = server.start(port).await {
                return Worker {
                    server,
                    port: addr.port(),
                    inbound,
                    cancel,
                };
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("Port never freed")
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("Condition not met in time");
}

#[tokio::test]
async fn test_selection_round_trip_through_worker_bus() {
    let mut worker = start_worker(0).await;
    let (events_tx, mut events) = mpsc::channel(16);
    let client = BusClient::new(fast_config(), events_tx, Arc::new(CountingNotifier::default()));
    let cancel = CancellationToken::new();
    let runner = tokio::spawn(client.clone().run(worker.port, cancel.clone()));

    wait_until(|| worker.server.peer_count() == Endpoint::ALL.len()).await;
    assert_eq!(client.state(Endpoint::Install), LinkState::Open);

    let request = SelectFilesRequest {
        archive: "pack.zip".into(),
        files: vec!["/staging/a.pak".into(), "/staging/b.pak".into()],
    };
    let prompt = Envelope::new(MessageKind::Status, STATUS_SELECT_FILES)
        .with_task_id("t-42")
        .with_payload(&request)
        .unwrap();
    assert_eq!(
        worker
            .server
            .broadcast_to_endpoint(Endpoint::Install, prompt)
            .await,
        1
    );

    let event = timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("No event")
        .expect("Event channel closed");
    let ClientEvent::SelectFiles { task_id, request: received } = event else {
        panic!("Expected SelectFiles, got {event:?}");
    };
    assert_eq!(task_id, "t-42");
    assert_eq!(received, request);

    let reply = Envelope::new(MessageKind::Status, STATUS_USER_SELECTION)
        .with_task_id("t-42")
        .with_payload(&UserSelection {
            files: vec!["/staging/b.pak".into()],
        })
        .unwrap();
    client.send_message(reply, Endpoint::Install).await.unwrap();

    let inbound = timeout(Duration::from_secs(2), worker.inbound.recv())
        .await
        .expect("Worker got nothing")
        .expect("Inbound channel closed");
    assert_eq!(inbound.endpoint, Endpoint::Install);
    assert_eq!(inbound.envelope.originator_id, client.originator_id().as_str());
    let selection: UserSelection = inbound.envelope.payload().unwrap();
    assert_eq!(selection.files, vec!["/staging/b.pak"]);

    cancel.cancel();
    timeout(Duration::from_secs(2), runner).await.unwrap().unwrap();
    worker.cancel.cancel();
}

#[tokio::test]
async fn test_cold_start_is_not_reported_as_lost() {
    // Reserve a port, then leave it unbound so the first attempts fail.
    let port = std::net::TcpListener::bind(("127.0.0.1", 0))
        .unwrap()
        .local_addr()
        .unwrap()
        .port();

    let notifier = Arc::new(CountingNotifier::default());
    let (events_tx, _events) = mpsc::channel(16);
    let client = BusClient::new(fast_config(), events_tx, notifier.clone());
    let cancel = CancellationToken::new();
    let runner = tokio::spawn(client.clone().run(port, cancel.clone()));

    wait_until(|| notifier.attempts.load(Ordering::SeqCst) >= 2).await;
    assert_eq!(notifier.lost.load(Ordering::SeqCst), 0);

    let worker = start_worker(port).await;
    wait_until(|| client.connected_count() == Endpoint::ALL.len()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(notifier.lost.load(Ordering::SeqCst), 0);
    assert_eq!(notifier.restored.load(Ordering::SeqCst), 0);

    cancel.cancel();
    timeout(Duration::from_secs(2), runner).await.unwrap().unwrap();
    worker.cancel.cancel();
}

#[tokio::test]
async fn test_outage_reports_lost_once_and_restored_once() {
    let first = start_worker(0).await;
    let port = first.port;

    let notifier = Arc::new(CountingNotifier::default());
    let (events_tx, _events) = mpsc::channel(16);
    let client = BusClient::new(fast_config(), events_tx, notifier.clone());
    let cancel = CancellationToken::new();
    let runner = tokio::spawn(client.clone().run(port, cancel.clone()));
    wait_until(|| client.connected_count() == Endpoint::ALL.len()).await;

    first.cancel.cancel();
    wait_until(|| notifier.attempts.load(Ordering::SeqCst) >= 2).await;
    assert_eq!(notifier.lost.load(Ordering::SeqCst), 1);
    assert_eq!(notifier.restored.load(Ordering::SeqCst), 0);

    let second = restart_worker(port).await;
    wait_until(|| client.connected_count() == Endpoint::ALL.len()).await;
    wait_until(|| notifier.restored.load(Ordering::SeqCst) == 1).await;

    // Healthy passes do not repeat the notice.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(notifier.restored.load(Ordering::SeqCst), 1);
    assert_eq!(notifier.lost.load(Ordering::SeqCst), 1);

    cancel.cancel();
    timeout(Duration::from_secs(2), runner).await.unwrap().unwrap();
    assert_eq!(client.connected_count(), 0);
    second.cancel.cancel();
}
